use thiserror::Error;

/// RLM error types.
///
/// Kinds 1 (root-call transport failure) and 5 (schema) surface to the
/// caller of [`crate::Rlm::completion`]; kinds 3 and 4 are recovered inside
/// the driver loop and never escape it.
#[derive(Error, Debug)]
pub enum RlmError {
    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sandbox fault: {0}")]
    Sandbox(String),

    #[error("sandbox execution timed out after {0:?}")]
    SandboxTimeout(std::time::Duration),

    #[error("tokio runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("max iterations reached ({0})")]
    MaxIterationsReached(u32),

    #[error("no API key found; set the provider's credential env var or RlmConfig::with_api_key")]
    MissingApiKey,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("context schema could not be rendered: {0}")]
    ContextSchema(String),
}

/// Result type alias for RLM operations.
pub type Result<T> = std::result::Result<T, RlmError>;
