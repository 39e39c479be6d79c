//! Text generation collaborators
//!
//! [`OpenAiGenerator`] talks to any OpenAI-compatible `/chat/completions`
//! endpoint. [`HeuristicGenerator`] is the offline stand-in used when no API
//! key is configured: it classifies with keyword vocabularies and reports
//! free-text generation as unavailable, so steps take their deterministic
//! fallbacks.

use crate::error::{ChatbotError, Result};
use crate::planner::{INTENT_MARKET, MARKET_TERMS};
use crate::settings::Settings;
use async_trait::async_trait;
use flowgraph_core::{ensure_label, CollaboratorError, Generator};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Build the generator the settings ask for
pub fn from_settings(settings: &Settings) -> Result<Arc<dyn Generator>> {
    match &settings.openai_api_key {
        Some(key) => {
            let generator = OpenAiGenerator::new(
                &settings.openai_base_url,
                key,
                &settings.openai_model,
                Duration::from_secs(settings.openai_timeout_secs),
            )?;
            Ok(Arc::new(generator))
        }
        None => Ok(Arc::new(
            HeuristicGenerator::new().with_vocabulary(INTENT_MARKET, MARKET_TERMS),
        )),
    }
}

/// OpenAI-compatible chat completions client
#[derive(Clone)]
pub struct OpenAiGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatbotError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    async fn complete(&self, system: Option<&str>, user: &str, max_tokens: usize) -> std::result::Result<String, CollaboratorError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage::new("system", system));
        }
        messages.push(ChatMessage::new("user", user));
        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: 0.0,
            max_tokens,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CollaboratorError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Request(format!("{status}: {detail}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Response(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| CollaboratorError::Response("completion has no content".to_string()))?;
        debug!(model = %self.model, chars = content.chars().count(), "Completion received");
        Ok(content)
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(&self, prompt: &str) -> std::result::Result<String, CollaboratorError> {
        self.complete(None, prompt, 500).await
    }

    async fn classify(&self, input: &str, labels: &[&str]) -> std::result::Result<String, CollaboratorError> {
        let system = format!(
            "Classify the user's input. Respond with exactly one of these labels and nothing else: {}",
            labels.join(", ")
        );
        let raw = self.complete(Some(&system), input, 10).await?;
        ensure_label(&raw, labels)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

impl ChatMessage {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Offline generator
///
/// `classify` returns the first label whose vocabulary occurs in the input;
/// without a hit it returns the first label that has no vocabulary, or the
/// first label if every label has one. Callers list their default label
/// first.
#[derive(Debug, Clone, Default)]
pub struct HeuristicGenerator {
    vocabularies: HashMap<String, Vec<String>>,
}

impl HeuristicGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vocabulary(mut self, label: &str, terms: &[&str]) -> Self {
        self.vocabularies
            .insert(label.to_string(), terms.iter().map(|t| t.to_lowercase()).collect());
        self
    }
}

#[async_trait]
impl Generator for HeuristicGenerator {
    async fn generate(&self, _prompt: &str) -> std::result::Result<String, CollaboratorError> {
        Err(CollaboratorError::Unavailable("no language model configured".to_string()))
    }

    async fn classify(&self, input: &str, labels: &[&str]) -> std::result::Result<String, CollaboratorError> {
        let lowered = input.to_lowercase();
        let hit = labels.iter().find(|label| {
            self.vocabularies
                .get(**label)
                .is_some_and(|terms| terms.iter().any(|term| lowered.contains(term.as_str())))
        });
        hit.or_else(|| labels.iter().find(|label| !self.vocabularies.contains_key(**label)))
            .or_else(|| labels.first())
            .map(|label| label.to_string())
            .ok_or_else(|| CollaboratorError::UnexpectedLabel {
                label: String::new(),
                allowed: Vec::new(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::INTENT_SMALLTALK;

    fn heuristic() -> HeuristicGenerator {
        HeuristicGenerator::new().with_vocabulary(INTENT_MARKET, MARKET_TERMS)
    }

    #[tokio::test]
    async fn test_heuristic_intent() {
        let labels = [INTENT_MARKET, INTENT_SMALLTALK];
        assert_eq!(heuristic().classify("주말 플리마켓 추천", &labels).await.unwrap(), "market");
        assert_eq!(heuristic().classify("오늘 기분 어때?", &labels).await.unwrap(), "smalltalk");
    }

    #[tokio::test]
    async fn test_heuristic_default_is_first_label() {
        let label = heuristic().classify("anything", &["relevant", "irrelevant"]).await.unwrap();
        assert_eq!(label, "relevant");
    }

    #[tokio::test]
    async fn test_heuristic_generate_is_unavailable() {
        let err = heuristic().generate("rewrite this").await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_heuristic_empty_labels() {
        assert!(heuristic().classify("x", &[]).await.is_err());
    }

    #[test]
    fn test_from_settings_picks_backend() {
        let mut settings = Settings::default();
        assert!(from_settings(&settings).is_ok());
        settings.openai_api_key = Some("sk-test".into());
        assert!(from_settings(&settings).is_ok());
    }

    #[test]
    fn test_request_body_shape() {
        let body = ChatRequest {
            model: "gpt-4o-mini",
            messages: vec![ChatMessage::new("user", "안녕")],
            temperature: 0.0,
            max_tokens: 10,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["max_tokens"], 10);
    }
}
