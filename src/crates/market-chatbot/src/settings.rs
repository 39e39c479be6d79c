//! Runtime settings
//!
//! Settings are layered, later sources overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. An optional TOML file (`--config` on the CLI)
//! 3. Environment variables: `MARKETFLOW_<FIELD>` for every field, plus the
//!    conventional `OPENAI_API_KEY`
//!
//! ```toml
//! app_env = "prod"
//! openai_model = "gpt-4o-mini"
//! max_results = 5
//! min_coverage = 0.4
//! ```

use crate::error::{ChatbotError, Result};
use flowgraph_core::RunConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const ENV_PREFIX: &str = "MARKETFLOW_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app_env: String,
    /// Enables the OpenAI-compatible generator when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    /// Per-request timeout for the generation service
    pub openai_timeout_secs: u64,
    pub seed_path: PathBuf,
    /// Items shown to the user, and the denominator of validation coverage
    pub max_results: usize,
    /// Laps allowed around a cycle, such as the rewrite loop, before the run falls back
    pub max_reentries: u32,
    /// Coverage a draft needs to pass validation
    pub min_coverage: f64,
    /// Whole-run deadline, `0` disables it
    pub run_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_env: "dev".to_string(),
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_timeout_secs: 20,
            seed_path: PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/data/seed.json")),
            max_results: 5,
            max_reentries: flowgraph_core::DEFAULT_MAX_REENTRIES,
            min_coverage: 0.4,
            run_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Load defaults, then `path` if given, then the process environment
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path).await?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        info!(app_env = %settings.app_env, llm = settings.openai_api_key.is_some(), "Settings loaded");
        Ok(settings)
    }

    /// Parse a TOML file; fields it omits keep their defaults
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ChatbotError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let settings: Settings = toml::from_str(&content)
            .map_err(|e| ChatbotError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Loaded settings file");
        Ok(settings)
    }

    /// Override fields from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |field: &str| lookup(&format!("{ENV_PREFIX}{}", field.to_uppercase()));

        if let Some(value) = var("app_env") {
            self.app_env = value;
        }
        if let Some(value) = var("openai_api_key").or_else(|| lookup("OPENAI_API_KEY")) {
            self.openai_api_key = Some(value).filter(|key| !key.trim().is_empty());
        }
        if let Some(value) = var("openai_model") {
            self.openai_model = value;
        }
        if let Some(value) = var("openai_base_url") {
            self.openai_base_url = value;
        }
        if let Some(value) = var("openai_timeout_secs") {
            self.openai_timeout_secs = parse_var("openai_timeout_secs", &value)?;
        }
        if let Some(value) = var("seed_path") {
            self.seed_path = PathBuf::from(value);
        }
        if let Some(value) = var("max_results") {
            self.max_results = parse_var("max_results", &value)?;
        }
        if let Some(value) = var("max_reentries") {
            self.max_reentries = parse_var("max_reentries", &value)?;
        }
        if let Some(value) = var("min_coverage") {
            self.min_coverage = parse_var("min_coverage", &value)?;
        }
        if let Some(value) = var("run_timeout_secs") {
            self.run_timeout_secs = parse_var("run_timeout_secs", &value)?;
        }
        Ok(())
    }

    /// Engine configuration derived from these settings
    pub fn run_config(&self) -> RunConfig {
        let config = RunConfig::default().with_max_reentries(self.max_reentries);
        match self.run_timeout_secs {
            0 => config,
            secs => config.with_timeout(Duration::from_secs(secs)),
        }
    }
}

fn parse_var<T: FromStr>(field: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        ChatbotError::Config(format!("{ENV_PREFIX}{}={value:?} is invalid: {e}", field.to_uppercase()))
    })
}
