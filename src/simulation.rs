use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time;

use crate::{
    conversation::{ConversationStep, Role, Transcript},
    turns::TurnGenerator,
    LLMError,
};

/// System prompts for both seats of one simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePrompts {
    pub agent: String,
    pub customer: String,
}

impl RolePrompts {
    pub fn new(agent: impl Into<String>, customer: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            customer: customer.into(),
        }
    }

    pub fn get(&self, role: Role) -> &str {
        match role {
            Role::Agent => &self.agent,
            Role::Customer => &self.customer,
        }
    }

    pub fn with(mut self, role: Role, prompt: impl Into<String>) -> Self {
        match role {
            Role::Agent => self.agent = prompt.into(),
            Role::Customer => self.customer = prompt.into(),
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationState {
    Seeded,
    Running,
    /// A turn carried the termination token.
    Terminated,
    /// The turn budget ran out first.
    Exhausted,
    /// A model call failed; only ever recorded, never produced by `run`.
    Failed,
}

#[derive(Debug, Clone)]
pub struct SimulationOutcome {
    pub transcript: Transcript,
    pub prefix_len: usize,
    pub generated_turns: usize,
    pub state: SimulationState,
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("turn {turn} ({role}) failed: {source}")]
    Turn {
        turn: usize,
        role: Role,
        #[source]
        source: LLMError,
        partial: Transcript,
    },
}

impl SimulationError {
    pub fn partial_transcript(&self) -> &Transcript {
        match self {
            SimulationError::Turn { partial, .. } => partial,
        }
    }
}

/// Drives alternating turns from a scripted prefix until the model ends the
/// conversation or the turn budget is spent.
#[derive(Clone)]
pub struct SimulationRunner {
    generator: TurnGenerator,
    max_turns: usize,
    turn_timeout: Duration,
    opener: Role,
}

impl SimulationRunner {
    pub fn new(generator: TurnGenerator, max_turns: usize) -> Self {
        Self {
            generator,
            max_turns,
            turn_timeout: Duration::from_secs(180),
            opener: Role::Agent,
        }
    }

    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    /// Who speaks first when the prefix is empty.
    pub fn with_opener(mut self, role: Role) -> Self {
        self.opener = role;
        self
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub async fn run(
        &self,
        prefix: Transcript,
        prompts: &RolePrompts,
    ) -> Result<SimulationOutcome, SimulationError> {
        let prefix_len = prefix.len();
        let first = prefix
            .last()
            .map(|step| step.role.other())
            .unwrap_or(self.opener);

        let mut transcript = prefix;
        let mut state = SimulationState::Seeded;
        let mut generated = 0usize;

        while generated < self.max_turns {
            state = SimulationState::Running;
            let role = if generated % 2 == 0 { first } else { first.other() };

            let call = self
                .generator
                .generate_turn(role, prompts.get(role), &transcript);
            let result = match time::timeout(self.turn_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(LLMError::Timeout(self.turn_timeout.as_millis() as u64)),
            };

            let turn = match result {
                Ok(turn) => turn,
                Err(source) => {
                    return Err(SimulationError::Turn {
                        turn: generated + 1,
                        role,
                        source,
                        partial: transcript,
                    })
                }
            };

            tracing::debug!(turn = generated + 1, %role, terminated = turn.terminated, "generated turn");
            transcript.push(ConversationStep::new(role, turn.text));
            generated += 1;

            if turn.terminated {
                state = SimulationState::Terminated;
                break;
            }
        }

        if state != SimulationState::Terminated {
            state = if generated == 0 {
                SimulationState::Seeded
            } else {
                SimulationState::Exhausted
            };
        }

        Ok(SimulationOutcome {
            transcript,
            prefix_len,
            generated_turns: generated,
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;

    use crate::{
        conversation::{ConversationStep, Role, Transcript},
        models::{ConversationModel, DialogueMessage},
        turns::TurnGenerator,
        LLMError,
    };

    use super::{RolePrompts, SimulationError, SimulationRunner, SimulationState};

    /// Replies with a counter; ends the conversation on the configured call.
    struct CountingModel {
        calls: Mutex<usize>,
        end_on: Option<usize>,
        fail_on: Option<usize>,
        prompts: Mutex<Vec<String>>,
    }

    impl CountingModel {
        fn new(end_on: Option<usize>, fail_on: Option<usize>) -> Self {
            Self {
                calls: Mutex::new(0),
                end_on,
                fail_on,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ConversationModel for CountingModel {
        async fn complete(
            &self,
            system_prompt: &str,
            _messages: &[DialogueMessage],
        ) -> Result<String, LLMError> {
            let call = {
                let mut guard = self.calls.lock().unwrap();
                *guard += 1;
                *guard
            };
            self.prompts.lock().unwrap().push(system_prompt.to_string());

            if self.fail_on == Some(call) {
                return Err(LLMError::Provider("rate limited".into()));
            }
            if self.end_on == Some(call) {
                return Ok(format!("reply {call} [END_CONVERSATION]"));
            }
            Ok(format!("reply {call}"))
        }
    }

    fn prefix() -> Transcript {
        Transcript::from_steps(vec![
            ConversationStep::new(Role::Agent, "Hello from Truss Payments."),
            ConversationStep::new(Role::Customer, "Not interested."),
            ConversationStep::new(Role::Agent, "What are your fees today?"),
        ])
    }

    fn prompts() -> RolePrompts {
        RolePrompts::new("agent prompt", "customer prompt")
    }

    #[tokio::test]
    async fn stops_on_termination_signal() {
        let model = Arc::new(CountingModel::new(Some(2), None));
        let runner = SimulationRunner::new(TurnGenerator::new(model), 10);

        let outcome = runner.run(prefix(), &prompts()).await.unwrap();
        assert_eq!(outcome.transcript.len(), 3 + 2);
        assert_eq!(outcome.generated_turns, 2);
        assert_eq!(outcome.state, SimulationState::Terminated);
        assert_eq!(outcome.transcript.last().unwrap().text, "reply 2");
    }

    #[tokio::test]
    async fn never_exceeds_turn_budget() {
        let model = Arc::new(CountingModel::new(None, None));
        let runner = SimulationRunner::new(TurnGenerator::new(model.clone()), 4);

        let outcome = runner.run(prefix(), &prompts()).await.unwrap();
        assert_eq!(outcome.generated_turns, 4);
        assert_eq!(outcome.transcript.len(), 7);
        assert_eq!(outcome.state, SimulationState::Exhausted);
        assert_eq!(*model.calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn termination_on_last_budgeted_turn_is_terminated() {
        let model = Arc::new(CountingModel::new(Some(3), None));
        let runner = SimulationRunner::new(TurnGenerator::new(model), 3);

        let outcome = runner.run(prefix(), &prompts()).await.unwrap();
        assert_eq!(outcome.generated_turns, 3);
        assert_eq!(outcome.state, SimulationState::Terminated);
    }

    #[tokio::test]
    async fn alternates_starting_after_prefix_speaker() {
        let model = Arc::new(CountingModel::new(None, None));
        let runner = SimulationRunner::new(TurnGenerator::new(model.clone()), 5);

        let outcome = runner.run(prefix(), &prompts()).await.unwrap();
        assert!(outcome.transcript.alternates_from(outcome.prefix_len));
        assert_eq!(outcome.transcript.steps()[3].role, Role::Customer);

        let seen = model.prompts.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "customer prompt",
                "agent prompt",
                "customer prompt",
                "agent prompt",
                "customer prompt"
            ]
        );
    }

    #[tokio::test]
    async fn empty_prefix_starts_with_opener() {
        let model = Arc::new(CountingModel::new(None, None));
        let runner =
            SimulationRunner::new(TurnGenerator::new(model), 2).with_opener(Role::Customer);

        let outcome = runner.run(Transcript::new(), &prompts()).await.unwrap();
        assert_eq!(outcome.transcript.steps()[0].role, Role::Customer);
        assert_eq!(outcome.transcript.steps()[1].role, Role::Agent);
    }

    #[tokio::test]
    async fn zero_budget_returns_prefix_unchanged() {
        let model = Arc::new(CountingModel::new(None, None));
        let runner = SimulationRunner::new(TurnGenerator::new(model), 0);

        let outcome = runner.run(prefix(), &prompts()).await.unwrap();
        assert_eq!(outcome.transcript, prefix());
        assert_eq!(outcome.state, SimulationState::Seeded);
    }

    #[tokio::test]
    async fn failed_turn_keeps_partial_transcript() {
        let model = Arc::new(CountingModel::new(None, Some(2)));
        let runner = SimulationRunner::new(TurnGenerator::new(model), 6);

        let err = runner.run(prefix(), &prompts()).await.unwrap_err();
        let SimulationError::Turn { turn, role, .. } = &err;
        assert_eq!(*turn, 2);
        assert_eq!(*role, Role::Agent);
        assert_eq!(err.partial_transcript().len(), 4);
    }

    /// Answers once, then stalls far past any turn timeout.
    struct Stalls {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl ConversationModel for Stalls {
        async fn complete(&self, _: &str, _: &[DialogueMessage]) -> Result<String, LLMError> {
            let call = {
                let mut guard = self.calls.lock().unwrap();
                *guard += 1;
                *guard
            };
            if call > 1 {
                tokio::time::sleep(Duration::from_secs(600)).await;
            }
            Ok(format!("reply {call}"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_turn_times_out_with_partial_transcript() {
        let model = Arc::new(Stalls { calls: Mutex::new(0) });
        let runner = SimulationRunner::new(TurnGenerator::new(model), 6)
            .with_turn_timeout(Duration::from_secs(2));

        let err = runner.run(prefix(), &prompts()).await.unwrap_err();
        match &err {
            SimulationError::Turn { turn, source, partial, .. } => {
                assert_eq!(*turn, 2);
                assert!(matches!(source, LLMError::Timeout(2000)));
                assert_eq!(partial.len(), 4);
                assert_eq!(partial.last().unwrap().text, "reply 1");
            }
        }
    }
}
