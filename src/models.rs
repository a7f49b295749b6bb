//! Capability traits the harness consumes, and an adapter that provides both
//! on top of any [`LLMProvider`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time;

use crate::{
    types::{ChatMessage, CompletionRequest},
    LLMError, LLMProvider,
};

/// Whose voice a history message is in, from the point of view of the
/// speaker about to reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    #[serde(rename = "self")]
    Me,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueMessage {
    pub speaker: Speaker,
    pub text: String,
}

impl DialogueMessage {
    pub fn me(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Me,
            text: text.into(),
        }
    }

    pub fn other(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Other,
            text: text.into(),
        }
    }
}

#[async_trait]
pub trait ConversationModel: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[DialogueMessage],
    ) -> Result<String, LLMError>;
}

#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub schema_name: String,
    pub schema: Value,
}

#[async_trait]
pub trait StructuredModel: Send + Sync {
    /// Returns a JSON value the backend claims matches `request.schema`.
    /// Callers still validate it.
    async fn complete_structured(&self, request: &StructuredRequest) -> Result<Value, LLMError>;
}

/// Binds a provider to a model id and exposes it as both a conversation model
/// and a structured model.
#[derive(Clone)]
pub struct ProviderModel {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    timeout: Duration,
}

impl ProviderModel {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: None,
            max_tokens: None,
            timeout: Duration::from_secs(180),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, mut request: CompletionRequest) -> Result<String, LLMError> {
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let response = match time::timeout(self.timeout, self.provider.complete(request)).await {
            Ok(result) => result?,
            Err(_) => return Err(LLMError::Timeout(self.timeout.as_millis() as u64)),
        };

        response
            .message
            .content
            .ok_or(LLMError::InvalidResponse("completion had no text content"))
    }
}

#[async_trait]
impl ConversationModel for ProviderModel {
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[DialogueMessage],
    ) -> Result<String, LLMError> {
        let mut chat = Vec::with_capacity(messages.len() + 1);
        chat.push(ChatMessage::system(system_prompt));
        chat.extend(messages.iter().map(|message| match message.speaker {
            Speaker::Me => ChatMessage::assistant(message.text.clone()),
            Speaker::Other => ChatMessage::user(message.text.clone()),
        }));

        self.send(CompletionRequest::new(self.model.clone(), chat)).await
    }
}

#[async_trait]
impl StructuredModel for ProviderModel {
    async fn complete_structured(&self, request: &StructuredRequest) -> Result<Value, LLMError> {
        let mut chat = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            chat.push(ChatMessage::system(system.clone()));
        }
        chat.push(ChatMessage::user(request.prompt.clone()));

        let completion = CompletionRequest::new(self.model.clone(), chat)
            .with_json_schema(&request.schema_name, request.schema.clone());
        let content = self.send(completion).await?;

        parse_json_content(&content)
    }
}

/// Parses a JSON object from a completion that may wrap it in prose or a
/// fenced block.
pub fn parse_json_content(content: &str) -> Result<Value, LLMError> {
    if let Ok(value) = serde_json::from_str::<Value>(content.trim()) {
        return Ok(value);
    }

    if let Some(fenced) = extract_json_from_fenced_block(content) {
        if let Ok(value) = serde_json::from_str::<Value>(&fenced) {
            return Ok(value);
        }
    }

    if let Some(object) = extract_last_json_object(content) {
        if let Ok(value) = serde_json::from_str::<Value>(object) {
            return Ok(value);
        }
    }

    Err(LLMError::SchemaMismatch(
        "completion did not contain a JSON object".to_string(),
    ))
}

fn extract_json_from_fenced_block(content: &str) -> Option<String> {
    let start = content.find("```json").or_else(|| content.find("```"))?;
    let remainder = &content[start..];
    let after_language = remainder.find('\n')?;
    let body = &remainder[after_language + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

// Quote/escape-aware: last complete top-level object.
fn extract_last_json_object(content: &str) -> Option<&str> {
    let bytes = content.as_bytes();
    let mut start_pos = None;
    let mut span = None;
    let mut depth: i32 = 0;
    let mut in_str = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }

        match b {
            b'"' => in_str = true,
            b'{' => {
                if depth == 0 {
                    start_pos = Some(i);
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = start_pos {
                        span = Some((start, i + 1));
                    }
                }
            }
            _ => {}
        }
    }

    span.map(|(start, end)| &content[start..end])
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::{
        providers::{scripted::ScriptedProvider, LLMProvider},
        types::{CompletionRequest, CompletionResponse, MessageRole},
        LLMError,
    };

    use super::*;

    #[tokio::test]
    async fn maps_self_and_other_onto_chat_roles() {
        let provider = Arc::new(ScriptedProvider::from_responses(["next line"]));
        let model = ProviderModel::new(provider.clone(), "gpt-test");

        let reply = model
            .complete(
                "be a customer",
                &[DialogueMessage::other("pitch"), DialogueMessage::me("no thanks")],
            )
            .await
            .unwrap();
        assert_eq!(reply, "next line");

        let request = provider.requests().remove(0);
        let roles: Vec<MessageRole> = request.messages.iter().map(|m| m.role.clone()).collect();
        assert_eq!(
            roles,
            vec![MessageRole::System, MessageRole::User, MessageRole::Assistant]
        );
        assert_eq!(request.model, "gpt-test");
    }

    #[tokio::test]
    async fn structured_call_sends_schema_and_parses_fenced_json() {
        let provider = Arc::new(ScriptedProvider::from_responses([
            "Here you go:\n```json\n{\"ok\": true}\n```",
        ]));
        let model = ProviderModel::new(provider.clone(), "judge");

        let value = model
            .complete_structured(&StructuredRequest {
                system: Some("grade".into()),
                prompt: "transcript".into(),
                schema_name: "verdict".into(),
                schema: json!({"type": "object"}),
            })
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));

        let request = provider.requests().remove(0);
        assert_eq!(request.messages.len(), 2);
        assert!(request.response_format.is_some());
    }

    #[test]
    fn extracts_last_object_from_prose() {
        let value = parse_json_content(r#"thinking {"a": "}"} final: {"b": 2} done"#).unwrap();
        assert_eq!(value, json!({"b": 2}));
        assert!(matches!(
            parse_json_content("no json here"),
            Err(LLMError::SchemaMismatch(_))
        ));
    }

    struct SlowProvider;

    #[async_trait]
    impl LLMProvider for SlowProvider {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Err(LLMError::Provider("unreachable".into()))
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn enforces_call_timeout() {
        let model = ProviderModel::new(Arc::new(SlowProvider), "m")
            .with_timeout(Duration::from_millis(250));
        let err = model.complete("sys", &[]).await.unwrap_err();
        assert!(matches!(err, LLMError::Timeout(250)));
    }
}
