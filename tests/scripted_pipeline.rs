use std::sync::Arc;

use promptsmith::{
    providers::scripted::ScriptedProvider, ConversationKind, ConversationScript, ConversationStep,
    Judge, LoopConfig, MemorySink, MessageRole, OptimizationLoop, Optimizer, ProviderModel, Role,
    RoleLabels, RolePrompts, Rubric, SequenceStartPicker, SimulationRunner, SimulationState,
    TurnGenerator,
};
use serde_json::json;

fn script() -> ConversationScript {
    ConversationScript::new(vec![
        ConversationStep::new(Role::Customer, "Hello? It's Mike."),
        ConversationStep::new(Role::Agent, "Hi Mike, this is Max from Truss Payments."),
        ConversationStep::new(Role::Customer, "We're on PayPal at 3.5%."),
        ConversationStep::new(Role::Agent, "We could take that under 2.7%."),
    ])
}

#[tokio::test]
async fn full_loop_through_provider_adapter() {
    let talk = Arc::new(ScriptedProvider::from_responses([
        "Go on, I'm listening.",
        "Our blended rate is 2.6%. Shall we book a demo? [END_CONVERSATION]",
        "Fine, but keep it short.",
        "I'll send the invite. [end_conversation]",
    ]));
    let grading = Arc::new(ScriptedProvider::from_responses([
        "```json\n{\"sales_agent\": {\"passed\": false, \"feedback\": \"pushy close\"}, \"customer_agent\": {\"passed\": true, \"feedback\": \"realistic\"}}\n```".to_string(),
        json!({"improved_prompt": "You are Max. Ask before closing.", "analysis": "closing was abrupt"}).to_string(),
        json!({"sales_agent": {"passed": true, "feedback": "asked first"}, "customer_agent": {"passed": true, "feedback": "ok"}}).to_string(),
    ]));

    let labels = RoleLabels::sales();
    let structured = Arc::new(ProviderModel::new(grading.clone(), "judge-model"));
    let optimization = OptimizationLoop::new(
        "sales-call",
        Arc::new(script()),
        SimulationRunner::new(
            TurnGenerator::new(Arc::new(ProviderModel::new(talk.clone(), "talk-model"))),
            4,
        ),
        Judge::new(structured.clone()).with_labels(labels.clone()),
        Optimizer::new(structured).with_labels(labels),
        Rubric::new("sales-grader", ConversationKind::Sales, "Did the agent ask before closing?"),
        Arc::new(MemorySink::new()),
    )
    .with_config(LoopConfig {
        max_iterations: 2,
        simulations_per_iteration: 1,
        prefix_length: 2,
        ..LoopConfig::default()
    });

    let run = optimization
        .run(
            RolePrompts::new("You are Max, a sales rep.", "You are Mike."),
            &mut SequenceStartPicker::new(vec![0]),
        )
        .await
        .unwrap();

    assert_eq!(talk.remaining(), 0);
    assert_eq!(grading.remaining(), 0);

    let first = &run.iterations[0].records[0];
    assert_eq!(first.terminal_state, SimulationState::Terminated);
    assert_eq!(first.transcript.len(), 4);
    assert_eq!(
        first.transcript.last().unwrap().text,
        "Our blended rate is 2.6%. Shall we book a demo?"
    );
    assert!(!first.passed());

    let second = &run.iterations[1].records[0];
    assert_eq!(second.transcript.last().unwrap().text, "I'll send the invite.");
    assert!(second.passed());
    assert_eq!(run.final_prompt, "You are Max. Ask before closing.");

    // Prefix ends with the agent, so the customer speaks first and sees its
    // own recorded line as an assistant message.
    let requests = talk.requests();
    let opening = &requests[0];
    assert_eq!(opening.model, "talk-model");
    assert_eq!(opening.messages[0].role, MessageRole::System);
    assert_eq!(opening.messages[0].text(), Some("You are Mike."));
    assert_eq!(opening.messages[1].role, MessageRole::Assistant);
    assert_eq!(opening.messages[2].role, MessageRole::User);
    assert_eq!(requests[3].messages[0].text(), Some("You are Max. Ask before closing."));

    let judge_request = &grading.requests()[0];
    let format = judge_request.response_format.as_ref().unwrap();
    assert_eq!(format["type"], json!("json_schema"));
    assert_eq!(format["json_schema"]["name"], json!("conversation_evaluation"));
    assert_eq!(grading.requests()[1].response_format.as_ref().unwrap()["json_schema"]["name"], json!("prompt_revision"));
}
