use thiserror::Error;

/// Crate error types
///
/// Nothing in this crate is allowed to turn a successful host response into
/// a failure: these errors stay internal and are logged, never propagated
/// into the response path.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Configuration loading or validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// Response body could not be inspected or rewritten
    #[error("injection error: {0}")]
    Inject(String),

    /// The user-registered end-of-trace hook failed
    #[error("end-of-trace hook error: {0}")]
    Hook(#[from] anyhow::Error),
}

impl From<config::ConfigError> for TraceError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_json::Error> for TraceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Inject(format!("JSON error: {}", err))
    }
}
