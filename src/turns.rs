use std::sync::Arc;

use regex::Regex;

use crate::{
    conversation::{Role, Transcript},
    models::{ConversationModel, DialogueMessage},
    LLMError,
};

pub const DEFAULT_TERMINATION_TOKEN: &str = "[END_CONVERSATION]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedTurn {
    pub text: String,
    pub terminated: bool,
}

/// Produces the next utterance for one seat of the conversation.
#[derive(Clone)]
pub struct TurnGenerator {
    model: Arc<dyn ConversationModel>,
    termination_token: String,
    termination: Regex,
}

impl TurnGenerator {
    pub fn new(model: Arc<dyn ConversationModel>) -> Self {
        Self::with_termination_token(model, DEFAULT_TERMINATION_TOKEN)
    }

    pub fn with_termination_token(model: Arc<dyn ConversationModel>, token: &str) -> Self {
        let termination = Regex::new(&format!("(?i){}", regex::escape(token)))
            .expect("escaped literal is a valid pattern");
        Self {
            model,
            termination_token: token.to_string(),
            termination,
        }
    }

    pub fn termination_token(&self) -> &str {
        &self.termination_token
    }

    pub async fn generate_turn(
        &self,
        role: Role,
        system_prompt: &str,
        history: &Transcript,
    ) -> Result<GeneratedTurn, LLMError> {
        let messages = dialogue_for(role, history);
        let raw = self.model.complete(system_prompt, &messages).await?;
        Ok(self.detect_termination(&raw))
    }

    fn detect_termination(&self, raw: &str) -> GeneratedTurn {
        if !self.termination.is_match(raw) {
            return GeneratedTurn {
                text: raw.trim().to_string(),
                terminated: false,
            };
        }

        GeneratedTurn {
            text: self.termination.replace_all(raw, "").trim().to_string(),
            terminated: true,
        }
    }
}

/// Rewrites a two-party transcript from `role`'s point of view: its own steps
/// become `self`, everything else `other`.
pub fn dialogue_for(role: Role, history: &Transcript) -> Vec<DialogueMessage> {
    history
        .iter()
        .map(|step| {
            if step.role == role {
                DialogueMessage::me(step.text.clone())
            } else {
                DialogueMessage::other(step.text.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::{
        conversation::{ConversationStep, Role, Transcript},
        models::{ConversationModel, DialogueMessage, Speaker},
        LLMError,
    };

    use super::{dialogue_for, TurnGenerator};

    struct EchoModel {
        reply: String,
        seen: Mutex<Vec<Vec<DialogueMessage>>>,
    }

    #[async_trait]
    impl ConversationModel for EchoModel {
        async fn complete(
            &self,
            _system_prompt: &str,
            messages: &[DialogueMessage],
        ) -> Result<String, LLMError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            Ok(self.reply.clone())
        }
    }

    fn history() -> Transcript {
        Transcript::from_steps(vec![
            ConversationStep::new(Role::Agent, "Hi, this is Alex."),
            ConversationStep::new(Role::Customer, "Not interested."),
        ])
    }

    #[test]
    fn own_steps_are_self_regardless_of_seat() {
        let as_customer = dialogue_for(Role::Customer, &history());
        assert_eq!(as_customer[0].speaker, Speaker::Other);
        assert_eq!(as_customer[1].speaker, Speaker::Me);

        let as_agent = dialogue_for(Role::Agent, &history());
        assert_eq!(as_agent[0].speaker, Speaker::Me);
        assert_eq!(as_agent[1].speaker, Speaker::Other);
    }

    #[tokio::test]
    async fn strips_termination_token() {
        let model = Arc::new(EchoModel {
            reply: "Thanks, goodbye! [end_conversation]".into(),
            seen: Mutex::new(Vec::new()),
        });
        let generator = TurnGenerator::new(model.clone());

        let turn = generator
            .generate_turn(Role::Agent, "sell", &history())
            .await
            .unwrap();
        assert!(turn.terminated);
        assert_eq!(turn.text, "Thanks, goodbye!");
        assert_eq!(model.seen.lock().unwrap()[0].len(), 2);
    }

    #[tokio::test]
    async fn plain_reply_is_not_terminal() {
        let model = Arc::new(EchoModel {
            reply: "  Could you share your fees?  ".into(),
            seen: Mutex::new(Vec::new()),
        });
        let generator = TurnGenerator::with_termination_token(model, "<<DONE>>");

        let turn = generator
            .generate_turn(Role::Agent, "sell", &history())
            .await
            .unwrap();
        assert!(!turn.terminated);
        assert_eq!(turn.text, "Could you share your fees?");
    }
}
