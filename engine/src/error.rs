//! Error taxonomy: NotFound/Mismatch are ordinary control-flow results;
//! Io/Serialize/Corrupt are fatal and propagated.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("key not found")]
    NotFound,

    #[error("compare-and-swap mismatch")]
    Mismatch,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt store: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
