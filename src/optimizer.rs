use std::sync::Arc;

use jsonschema::{Draft, JSONSchema};
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    conversation::{Role, RoleLabels},
    judge::Rubric,
    models::{StructuredModel, StructuredRequest},
    prompts,
    record::{percent, SimulationRecord},
    LLMError,
};

#[derive(Debug, thiserror::Error)]
pub enum OptimizeError {
    #[error("optimizer needs at least one simulation record")]
    NoRecords,
    #[error("optimizer response violated the revision schema: {0}")]
    SchemaViolation(String),
    #[error("template render error: {0}")]
    TemplateRender(#[from] handlebars::RenderError),
    #[error(transparent)]
    Model(LLMError),
}

impl From<LLMError> for OptimizeError {
    fn from(error: LLMError) -> Self {
        match error {
            LLMError::SchemaMismatch(reason) => OptimizeError::SchemaViolation(reason),
            other => OptimizeError::Model(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRevision {
    pub new_prompt: String,
    pub rationale: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct RevisionResponse {
    /// The complete improved system prompt.
    improved_prompt: String,
    /// What was changed and why, based on the results.
    analysis: String,
}

#[derive(Serialize)]
struct FeedbackLine {
    label: String,
    passed: bool,
    text: String,
}

#[derive(Serialize)]
struct RecordView {
    simulation_id: usize,
    start_index: usize,
    passed: bool,
    transcript: String,
    feedback: Vec<FeedbackLine>,
}

#[derive(Serialize)]
struct OptimizerPromptData<'a> {
    role_display: &'a str,
    kind: &'a str,
    current_prompt: &'a str,
    rubric_id: &'a str,
    rubric_version: &'a str,
    criteria: &'a str,
    passed: usize,
    total: usize,
    pass_rate: String,
    records: Vec<RecordView>,
}

/// Rewrites the system prompt of one role from judged transcripts. Produces a
/// single candidate; nothing here guards against a regression.
#[derive(Clone)]
pub struct Optimizer {
    model: Arc<dyn StructuredModel>,
    labels: RoleLabels,
    target: Role,
}

impl Optimizer {
    pub fn new(model: Arc<dyn StructuredModel>) -> Self {
        Self {
            model,
            labels: RoleLabels::default(),
            target: Role::Agent,
        }
    }

    pub fn with_labels(mut self, labels: RoleLabels) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_target(mut self, role: Role) -> Self {
        self.target = role;
        self
    }

    pub fn target(&self) -> Role {
        self.target
    }

    pub async fn optimize(
        &self,
        current_prompt: &str,
        rubric: &Rubric,
        records: &[SimulationRecord],
    ) -> Result<PromptRevision, OptimizeError> {
        if records.is_empty() {
            return Err(OptimizeError::NoRecords);
        }

        let prompt = self.render_prompt(current_prompt, rubric, records)?;
        revise(
            self.model.as_ref(),
            prompts::OPTIMIZER_SYSTEM,
            prompt,
            "prompt_revision",
        )
        .await
    }

    pub fn render_prompt(
        &self,
        current_prompt: &str,
        rubric: &Rubric,
        records: &[SimulationRecord],
    ) -> Result<String, OptimizeError> {
        let passed = records.iter().filter(|record| record.passed()).count();
        let views = records
            .iter()
            .map(|record| RecordView {
                simulation_id: record.simulation_id,
                start_index: record.start_index,
                passed: record.passed(),
                transcript: record.transcript.render(&self.labels),
                feedback: record
                    .evaluation
                    .roles()
                    .map(|role| FeedbackLine {
                        label: self.labels.get(role).display.clone(),
                        passed: record.evaluation.passed(role).unwrap_or(false),
                        text: record.evaluation.feedback(role).unwrap_or_default().to_string(),
                    })
                    .collect(),
            })
            .collect();

        let data = OptimizerPromptData {
            role_display: &self.labels.get(self.target).display,
            kind: rubric.kind.participants(),
            current_prompt,
            rubric_id: &rubric.id,
            rubric_version: &rubric.version,
            criteria: &rubric.criteria,
            passed,
            total: records.len(),
            pass_rate: percent(passed as f64 / records.len() as f64),
            records: views,
        };

        Ok(prompts::render(prompts::OPTIMIZER_TEMPLATE, &data)?)
    }
}

/// Sends one revision request and validates the `{improved_prompt,
/// analysis}` reply.
pub(crate) async fn revise(
    model: &dyn StructuredModel,
    system: &str,
    prompt: String,
    schema_name: &str,
) -> Result<PromptRevision, OptimizeError> {
    let schema = serde_json::to_value(schema_for!(RevisionResponse))
        .map_err(|error| OptimizeError::Model(LLMError::Serialization(error)))?;
    let request = StructuredRequest {
        system: Some(system.to_string()),
        prompt,
        schema_name: schema_name.to_string(),
        schema: strip_meta(schema),
    };

    let response = model.complete_structured(&request).await?;
    parse_revision(&request.schema, response)
}

fn strip_meta(mut schema: Value) -> Value {
    if let Some(object) = schema.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    schema
}

fn parse_revision(schema: &Value, response: Value) -> Result<PromptRevision, OptimizeError> {
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|error| OptimizeError::SchemaViolation(format!("revision schema did not compile: {error}")))?;
    if let Err(errors) = compiled.validate(&response) {
        let details = errors.take(5).map(|e| e.to_string()).collect::<Vec<_>>();
        return Err(OptimizeError::SchemaViolation(details.join("; ")));
    }

    let parsed: RevisionResponse = serde_json::from_value(response)
        .map_err(|error| OptimizeError::SchemaViolation(error.to_string()))?;
    let new_prompt = parsed.improved_prompt.trim().to_string();
    if new_prompt.is_empty() {
        return Err(OptimizeError::SchemaViolation("improved_prompt was empty".to_string()));
    }

    Ok(PromptRevision {
        new_prompt,
        rationale: parsed.analysis.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::{
        conversation::{ConversationStep, Role, RoleLabels, Transcript},
        judge::{ConversationKind, EvaluationResult, RoleVerdict, Rubric},
        models::{StructuredModel, StructuredRequest},
        record::SimulationRecord,
        simulation::SimulationState,
        LLMError,
    };

    use super::{OptimizeError, Optimizer};

    struct CannedModel {
        response: Result<Value, String>,
        seen: Mutex<Vec<StructuredRequest>>,
    }

    impl CannedModel {
        fn ok(response: Value) -> Self {
            Self {
                response: Ok(response),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StructuredModel for CannedModel {
        async fn complete_structured(&self, request: &StructuredRequest) -> Result<Value, LLMError> {
            self.seen.lock().unwrap().push(request.clone());
            self.response.clone().map_err(LLMError::Provider)
        }
    }

    fn rubric() -> Rubric {
        Rubric::new("sales", ConversationKind::Sales, "Handle objections professionally.")
    }

    fn record(id: usize, passed: bool, feedback: &str) -> SimulationRecord {
        SimulationRecord {
            iteration: 1,
            simulation_id: id,
            start_index: id * 2,
            transcript: Transcript::from_steps(vec![
                ConversationStep::new(Role::Customer, "Too expensive."),
                ConversationStep::new(Role::Agent, "Let me explain our rates."),
            ]),
            evaluation: EvaluationResult::from_verdicts([
                (Role::Agent, RoleVerdict { passed, feedback: feedback.to_string() }),
                (Role::Customer, RoleVerdict { passed: true, feedback: "realistic".into() }),
            ]),
            duration_ms: 10,
            terminal_state: SimulationState::Exhausted,
            error: None,
        }
    }

    #[tokio::test]
    async fn returns_revision_and_embeds_feedback() {
        let model = Arc::new(CannedModel::ok(json!({
            "improved_prompt": "  You are Alex. Lead with savings.  ",
            "analysis": "Objections were ignored."
        })));
        let optimizer = Optimizer::new(model.clone()).with_labels(RoleLabels::sales());

        let revision = optimizer
            .optimize(
                "You are a sales rep.",
                &rubric(),
                &[record(1, false, "ignored the fee objection"), record(2, true, "good")],
            )
            .await
            .unwrap();
        assert_eq!(revision.new_prompt, "You are Alex. Lead with savings.");
        assert_eq!(revision.rationale, "Objections were ignored.");

        let request = model.seen.lock().unwrap().remove(0);
        assert!(request.prompt.contains("You are a sales rep."));
        assert!(request.prompt.contains("1/2 simulations passed (50.00%)"));
        assert!(request.prompt.contains("Sales Agent: fail. ignored the fee objection"));
        assert!(request.prompt.contains("Customer: Too expensive."));
    }

    #[tokio::test]
    async fn empty_records_are_rejected() {
        let model = Arc::new(CannedModel::ok(json!({})));
        let optimizer = Optimizer::new(model.clone());

        let err = optimizer.optimize("p", &rubric(), &[]).await.unwrap_err();
        assert!(matches!(err, OptimizeError::NoRecords));
        assert!(model.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_prompt_is_schema_violation() {
        let model = Arc::new(CannedModel::ok(json!({
            "improved_prompt": "   ",
            "analysis": "nothing"
        })));
        let optimizer = Optimizer::new(model);

        let err = optimizer
            .optimize("p", &rubric(), &[record(1, false, "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizeError::SchemaViolation(_)));
    }

    #[tokio::test]
    async fn model_failure_is_reported() {
        let model = Arc::new(CannedModel {
            response: Err("overloaded".into()),
            seen: Mutex::new(Vec::new()),
        });
        let optimizer = Optimizer::new(model);

        let err = optimizer
            .optimize("p", &rubric(), &[record(1, false, "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizeError::Model(LLMError::Provider(_))));
    }
}
