use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("no installed runtime matches {language} {selector}")]
    RuntimeUnknown { language: String, selector: String },

    #[error("sandbox setup failed: {0}")]
    SandboxSetup(String),

    #[error("sandbox identity pool is shut down")]
    PoolExhausted,

    #[error("stage execution failed: {0}")]
    Stage(String),

    #[error("illegal job state: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure of the underlying message channel; always treated as a
/// disconnect by the session.
#[derive(Debug, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);
