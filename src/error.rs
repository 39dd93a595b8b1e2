//! Error types for vocabulary loading and token conversion.

use std::path::PathBuf;
use thiserror::Error;

use crate::base::Token;

#[derive(Error, Debug)]
pub enum CodecError {
    /// The registry has no vocabulary under this name
    #[error("vocabulary not found: {name}")]
    ResourceNotFound { name: String },

    /// The vocabulary exists but could not be read or parsed
    #[error("failed to load vocabulary {name}: {reason}")]
    ResourceLoad { name: String, reason: String },

    /// A token id outside the loaded vocabulary
    #[error("invalid token id {id} (vocabulary size {vocab_size})")]
    InvalidTokenId { id: Token, vocab_size: usize },

    /// The split pattern failed while matching (e.g. backtrack limit hit)
    #[error("regex match failed: {0}")]
    RegexMatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    pub(crate) fn load(name: &str, reason: impl ToString) -> Self {
        CodecError::ResourceLoad {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
