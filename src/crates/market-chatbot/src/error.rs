//! Error types for the market chatbot
//!
//! Collaborator failures never show up here: steps recover them and record
//! the message under `insights`. What remains are startup problems (settings,
//! seed data) and engine errors that reach the service boundary.

use flowgraph_core::GraphError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for chatbot operations
pub type Result<T> = std::result::Result<T, ChatbotError>;

#[derive(Error, Debug)]
pub enum ChatbotError {
    /// Settings file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Seed dataset missing or malformed
    #[error("Seed data error at {path}: {reason}")]
    Dataset { path: PathBuf, reason: String },

    /// Engine failure (construction defect, cancellation, timeout)
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChatbotError {
    pub fn dataset(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Dataset {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_error_names_path() {
        let err = ChatbotError::dataset("data/seed.json", "missing field `markets`");
        assert_eq!(
            err.to_string(),
            "Seed data error at data/seed.json: missing field `markets`"
        );
    }

    #[test]
    fn test_graph_error_is_transparent() {
        let err: ChatbotError = GraphError::Cancelled.into();
        assert_eq!(err.to_string(), "Run cancelled");
    }
}
