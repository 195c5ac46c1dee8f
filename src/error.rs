use thiserror::Error;

#[derive(Error, Debug)]
pub enum CactusError {
    #[error("Failed to initialize context: {0}")]
    InitFailure(String),

    #[error("Native call {call} failed with status {code}")]
    NativeCallFailure { call: &'static str, code: i32 },

    #[error("Invalid input: {0}")]
    MarshallingError(String),

    #[error("{0} called on a null context handle")]
    NullHandleMisuse(&'static str),

    #[error("Operation not supported by this engine: {0}")]
    Unsupported(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Async task failed: {0}")]
    TaskFailed(String),
}

impl CactusError {
    pub(crate) fn marshal(msg: impl Into<String>) -> Self {
        CactusError::MarshallingError(msg.into())
    }

    /// Status code reported by the engine, if this error came from a native call
    pub fn native_code(&self) -> Option<i32> {
        match self {
            CactusError::NativeCallFailure { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CactusError>;
