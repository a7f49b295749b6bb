use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("provider rejected the credentials: {0}")]
    Unauthorized(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("model call timed out after {0} ms")]
    Timeout(u64),

    #[error("response did not match the requested schema: {0}")]
    SchemaMismatch(String),
}

impl LLMError {
    /// Errors that retrying cannot fix, such as a missing or rejected key.
    pub fn is_permanent(&self) -> bool {
        matches!(self, LLMError::MissingApiKey(_) | LLMError::Unauthorized(_))
    }
}
