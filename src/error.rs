use std::path::PathBuf;

use thiserror::Error;

/// Errors raised outside the tensor kernels: configuration, data contract
/// violations and checkpoint lookup.
#[derive(Debug, Error)]
pub enum Seq2SeqError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no checkpoint found in {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("vocabulary error: {0}")]
    Vocabulary(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Seq2SeqError>;
