//! Batch prompt runner
//!
//! Replays a stored prompt file through the chatbot and produces a JSON
//! report. The input looks like:
//!
//! ```json
//! { "prompts": [ { "id": "c-01", "role": "consumer", "section": "추천", "text": "..." } ] }
//! ```
//!
//! A failing prompt is recorded in the report and counted; it never stops
//! the batch.

use crate::chatbot::Chatbot;
use crate::error::{ChatbotError, Result};
use crate::schema::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct PromptFile {
    #[serde(default)]
    prompts: Vec<PromptRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptResult {
    pub id: Option<String>,
    pub role: Role,
    pub section: Option<String>,
    pub text: String,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub generated_at: DateTime<Utc>,
    pub input_file: String,
    pub count: usize,
    pub roles: Vec<Role>,
    pub failures: usize,
    pub results: Vec<PromptResult>,
}

/// Read a prompt file; an empty prompt list is an error
pub async fn load_prompts(path: &Path) -> Result<Vec<PromptRecord>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ChatbotError::Config(format!("Prompt file {} unreadable: {e}", path.display())))?;
    let file: PromptFile = serde_json::from_str(&content)?;
    if file.prompts.is_empty() {
        return Err(ChatbotError::Config(format!("{} has no prompts", path.display())));
    }
    Ok(file.prompts)
}

/// Parse a role filter; empty, `all` or nothing recognisable means every role
pub fn select_roles<S: AsRef<str>>(values: &[S]) -> Vec<Role> {
    if values.is_empty() || values.iter().any(|v| v.as_ref().eq_ignore_ascii_case("all")) {
        return Role::ALL.to_vec();
    }
    let mut roles: Vec<Role> = Vec::new();
    for role in values.iter().filter_map(|v| v.as_ref().parse::<Role>().ok()) {
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    if roles.is_empty() {
        Role::ALL.to_vec()
    } else {
        roles
    }
}

/// Prompts for the given roles, at most `limit` of them (`0`: all)
pub fn select_prompts(prompts: Vec<PromptRecord>, roles: &[Role], limit: usize) -> Vec<PromptRecord> {
    let selected = prompts.into_iter().filter(|p| roles.contains(&p.role));
    match limit {
        0 => selected.collect(),
        n => selected.take(n).collect(),
    }
}

/// Run prompts one after another
pub async fn run_batch(chatbot: &Chatbot, input_file: &Path, prompts: Vec<PromptRecord>, roles: Vec<Role>) -> BatchReport {
    let mut results = Vec::with_capacity(prompts.len());
    let mut failures = 0;
    for prompt in prompts {
        let (result, error) = match chatbot.ask(prompt.role, &prompt.text).await {
            Ok(outcome) => (Some(outcome.response), None),
            Err(e) => {
                warn!(id = ?prompt.id, error = %e, "Prompt failed");
                failures += 1;
                (None, Some(e.to_string()))
            }
        };
        results.push(PromptResult {
            id: prompt.id,
            role: prompt.role,
            section: prompt.section,
            text: prompt.text,
            result,
            error,
        });
    }
    BatchReport {
        generated_at: Utc::now(),
        input_file: input_file.display().to_string(),
        count: results.len(),
        roles,
        failures,
        results,
    }
}

/// `results/test_prompts_results_<UTC timestamp>.json`
pub fn default_report_path(results_dir: &Path, now: DateTime<Utc>) -> PathBuf {
    results_dir.join(format!("test_prompts_results_{}.json", now.format("%Y%m%dT%H%M%SZ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn prompt(id: &str, role: Role) -> PromptRecord {
        PromptRecord {
            id: Some(id.to_string()),
            role,
            section: None,
            text: "마켓 추천".to_string(),
        }
    }

    #[test]
    fn test_select_roles() {
        assert_eq!(select_roles::<&str>(&[]), Role::ALL.to_vec());
        assert_eq!(select_roles(&["ALL"]), Role::ALL.to_vec());
        assert_eq!(select_roles(&["seller", "seller"]), vec![Role::Seller]);
        assert_eq!(select_roles(&["buyer"]), Role::ALL.to_vec());
    }

    #[test]
    fn test_select_prompts_filters_and_limits() {
        let prompts = vec![
            prompt("c-1", Role::Consumer),
            prompt("s-1", Role::Seller),
            prompt("c-2", Role::Consumer),
        ];
        let selected = select_prompts(prompts.clone(), &[Role::Consumer], 0);
        assert_eq!(selected.len(), 2);
        let selected = select_prompts(prompts, &Role::ALL, 2);
        let ids: Vec<_> = selected.iter().filter_map(|p| p.id.as_deref()).collect();
        assert_eq!(ids, vec!["c-1", "s-1"]);
    }

    #[test]
    fn test_default_report_path() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 9, 30, 0).unwrap();
        let path = default_report_path(Path::new("results"), now);
        assert_eq!(path, PathBuf::from("results/test_prompts_results_20260501T093000Z.json"));
    }

    #[tokio::test]
    async fn test_load_prompts_rejects_empty_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("prompts.json");
        tokio::fs::write(&path, r#"{"prompts": []}"#).await.unwrap();
        assert!(load_prompts(&path).await.is_err());

        tokio::fs::write(&path, r#"{"prompts": [{"id": "s-1", "role": "seller", "text": "입점 문의"}]}"#)
            .await
            .unwrap();
        let prompts = load_prompts(&path).await.unwrap();
        assert_eq!(prompts[0].role, Role::Seller);
    }
}
