use thiserror::Error;

/// Failure reported by a native engine call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("{0}")]
    Native(String),

    #[error("operation not supported by this engine: {0}")]
    Unsupported(&'static str),
}

impl EngineError {
    #[inline]
    pub fn native<S: Into<String>>(msg: S) -> Self {
        EngineError::Native(msg.into())
    }
}

impl From<String> for EngineError {
    fn from(msg: String) -> Self {
        EngineError::Native(msg)
    }
}

impl From<&str> for EngineError {
    fn from(msg: &str) -> Self {
        EngineError::Native(msg.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
