use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

/// Replays queued replies in order. A queued `Err` is surfaced as a provider
/// error, which lets callers exercise failure paths without a network.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn from_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = Self::new();
        for response in responses {
            provider.push_response(response);
        }
        provider
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.lock_responses().push_back(Ok(response.into()));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.lock_responses().push_back(Err(message.into()));
    }

    pub fn remaining(&self) -> usize {
        self.lock_responses().len()
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, String>>> {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);

        match self.lock_responses().pop_front() {
            Some(Ok(response)) => Ok(CompletionResponse {
                message: ChatMessage::assistant(response),
                usage: None,
            }),
            Some(Err(message)) => Err(LLMError::Provider(message)),
            None => Err(LLMError::Provider("no more scripted responses".to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        providers::LLMProvider,
        types::{ChatMessage, CompletionRequest},
        LLMError,
    };

    use super::ScriptedProvider;

    #[tokio::test]
    async fn replays_in_order_then_errors() {
        let provider = ScriptedProvider::from_responses(["first", "second"]);
        provider.push_error("backend down");

        let request = CompletionRequest::new("m", vec![ChatMessage::user("hi")]);
        let first = provider.complete(request.clone()).await.unwrap();
        let second = provider.complete(request.clone()).await.unwrap();
        assert_eq!(first.message.text(), Some("first"));
        assert_eq!(second.message.text(), Some("second"));

        let err = provider.complete(request.clone()).await.unwrap_err();
        assert!(matches!(err, LLMError::Provider(message) if message == "backend down"));

        let exhausted = provider.complete(request).await.unwrap_err();
        assert!(matches!(exhausted, LLMError::Provider(_)));
        assert_eq!(provider.requests().len(), 4);
    }
}
