//! Contracts for the external services steps call into
//!
//! The engine never talks to a vector index or a text-generation service
//! directly. Steps receive collaborator handles at graph-build time (one
//! long-lived `Arc` per process) and call them through these traits.
//!
//! Implementations must be safe to call concurrently: fan-out branches share
//! the same handle. Failures are reported as [`CollaboratorError`] and it is
//! the calling step's job to substitute an empty result.
//!
//! # Example Implementation
//!
//! ```rust
//! use async_trait::async_trait;
//! use flowgraph_core::collaborator::{Record, Retriever, SearchFilter};
//! use flowgraph_core::error::CollaboratorError;
//!
//! struct Empty;
//!
//! #[async_trait]
//! impl Retriever for Empty {
//!     async fn search(
//!         &self,
//!         _query: &str,
//!         _limit: usize,
//!         _filter: Option<&SearchFilter>,
//!     ) -> Result<Vec<Record>, CollaboratorError> {
//!         Ok(Vec::new())
//!     }
//! }
//! ```

use crate::error::CollaboratorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One retrieved item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier used for de-duplication across tasks
    pub id: String,
    /// Display fields handed to formatters
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Relevance-adjacent score, higher is better
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
            score: None,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Flatten into the JSON object stored under `evidence`
    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        if let Some(score) = self.score {
            object.insert("score".to_string(), Value::from(score));
        }
        Value::Object(object)
    }
}

/// Key/value equality filter passed through to the retrieval backend
pub type SearchFilter = BTreeMap<String, Value>;

/// Similarity or structured search backend
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return at most `limit` records, best first
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<Record>, CollaboratorError>;
}

/// Text generation and classification service
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce free text for a prompt
    async fn generate(&self, prompt: &str) -> Result<String, CollaboratorError>;

    /// Pick exactly one of `labels` for `input`
    ///
    /// Implementations must return a member of `labels`;
    /// [`ensure_label`] helps normalize raw model output.
    async fn classify(&self, input: &str, labels: &[&str]) -> Result<String, CollaboratorError>;
}

/// Match raw classifier output against an allowed label set
///
/// Comparison is case-insensitive and ignores surrounding whitespace and
/// quotes. Longer labels are tried first so `"irrelevant"` is not read as
/// `"relevant"`.
pub fn ensure_label(raw: &str, labels: &[&str]) -> Result<String, CollaboratorError> {
    let normalized = raw.trim().trim_matches(|c| c == '"' || c == '\'' || c == '.').to_lowercase();
    if let Some(exact) = labels.iter().find(|l| l.to_lowercase() == normalized) {
        return Ok(exact.to_string());
    }
    let mut by_len: Vec<&&str> = labels.iter().collect();
    by_len.sort_by_key(|l| std::cmp::Reverse(l.len()));
    by_len
        .into_iter()
        .find(|l| normalized.contains(&l.to_lowercase()))
        .map(|l| l.to_string())
        .ok_or_else(|| CollaboratorError::UnexpectedLabel {
            label: raw.trim().to_string(),
            allowed: labels.iter().map(|l| l.to_string()).collect(),
        })
}

/// Pure rendering of retrieved items into user-facing text
///
/// Must be deterministic for identical input.
pub trait Formatter: Send + Sync {
    fn format(&self, items: &[Value]) -> String;
}

impl<F> Formatter for F
where
    F: Fn(&[Value]) -> String + Send + Sync,
{
    fn format(&self, items: &[Value]) -> String {
        self(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_to_value_flattens() {
        let record = Record::new("m-1").with_field("name", "야시장").with_score(2.5);
        let value = record.to_value();
        assert_eq!(value["id"], json!("m-1"));
        assert_eq!(value["name"], json!("야시장"));
        assert_eq!(value["score"], json!(2.5));
    }

    #[test]
    fn test_ensure_label_prefers_longest_match() {
        let labels = ["relevant", "irrelevant"];
        assert_eq!(ensure_label("Irrelevant.", &labels).unwrap(), "irrelevant");
        assert_eq!(ensure_label(" \"relevant\" ", &labels).unwrap(), "relevant");
        assert_eq!(ensure_label("the docs are irrelevant", &labels).unwrap(), "irrelevant");
    }

    #[test]
    fn test_ensure_label_rejects_unknown() {
        let err = ensure_label("maybe", &["yes", "no"]).unwrap_err();
        assert!(matches!(err, CollaboratorError::UnexpectedLabel { .. }));
    }

    #[test]
    fn test_closure_formatter() {
        let formatter = |items: &[Value]| format!("{} items", items.len());
        assert_eq!(Formatter::format(&formatter, &[json!({}), json!({})]), "2 items");
    }
}
