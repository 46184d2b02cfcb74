use thiserror::Error;

use crate::types::DType;

#[derive(Error, Debug)]
pub enum LorafuseError {
    #[error("Argument error: {0}")]
    Argument(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Untrusted remote code: {0}")]
    Trust(String),

    #[error("Model load error: {0}")]
    Load(String),

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported dtype: {0:?}")]
    UnsupportedDtype(DType),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LorafuseError {
    /// Re-tag an arithmetic failure raised while merging adapter weights.
    ///
    /// Shape and dtype errors from the backend keep their detail but are
    /// reported as merge failures, since that is the stage that hit them.
    pub fn into_merge(self, module: &str) -> Self {
        match self {
            LorafuseError::Merge(_) => self,
            other => LorafuseError::Merge(format!("{module}: {other}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, LorafuseError>;
