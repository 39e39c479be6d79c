//! Service entry point
//!
//! A [`Chatbot`] owns the compiled workflow and answers one query per call.
//! Calls are independent and may run concurrently.
//!
//! ```rust,no_run
//! use market_chatbot::{Chatbot, Role, Settings};
//!
//! # async fn example() -> market_chatbot::Result<()> {
//! let chatbot = Chatbot::from_settings(Settings::load(None).await?).await?;
//! let outcome = chatbot.ask(Role::Consumer, "주말 빈티지 플리마켓 추천해줘").await?;
//! println!("{}", outcome.response);
//! # Ok(())
//! # }
//! ```

use crate::dataset::SeedDataset;
use crate::error::Result;
use crate::generator;
use crate::schema::*;
use crate::settings::Settings;
use crate::validation::ValidationVerdict;
use crate::workflow::{compile_workflow, Collaborators, WorkflowContext};
use flowgraph_core::{CancellationToken, CompiledGraph, PartialState, COMPLETED_TASKS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, Instrument};
use uuid::Uuid;

/// What the service layer gets back for one query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOutcome {
    pub run_id: Uuid,
    pub role: Role,
    pub query: String,
    /// Always non-empty
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    pub guardrail_triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationVerdict>,
    pub completed_tasks: Vec<String>,
    /// Recovered collaborator failures and other diagnostics
    pub insights: Map<String, Value>,
    /// Node path through the graph
    pub visited: Vec<String>,
    /// Whether the cycle bound forced the fallback answer
    pub forced_fallback: bool,
    pub latency_ms: i64,
}

pub struct Chatbot {
    graph: CompiledGraph,
    settings: Settings,
}

impl Chatbot {
    /// Build with explicit collaborators
    pub fn new(settings: Settings, dataset: Arc<SeedDataset>, collaborators: Collaborators) -> Result<Self> {
        let ctx = Arc::new(WorkflowContext::new(&settings, dataset, collaborators)?);
        let graph = compile_workflow(&settings, ctx)?;
        Ok(Self { graph, settings })
    }

    /// Load the seed dataset and pick a generator from the settings
    pub async fn from_settings(settings: Settings) -> Result<Self> {
        let dataset = Arc::new(SeedDataset::load(&settings.seed_path).await?);
        let generator = generator::from_settings(&settings)?;
        let collaborators = Collaborators::seeded(dataset.clone(), generator);
        Self::new(settings, dataset, collaborators)
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn ask(&self, role: Role, query: &str) -> Result<ChatOutcome> {
        self.ask_with_cancel(role, query, CancellationToken::new()).await
    }

    /// Answer a query, stopping early if `token` is cancelled
    pub async fn ask_with_cancel(&self, role: Role, query: &str, token: CancellationToken) -> Result<ChatOutcome> {
        let initial = PartialState::new()
            .set(ROLE, role.as_str())
            .set(QUERY, query.trim());
        let span = tracing::info_span!("ask", role = %role);
        let outcome = self.graph.run_traced(initial, token).instrument(span).await?;

        let state = outcome.snapshot();
        let answer = ChatOutcome {
            run_id: outcome.run_id,
            role,
            query: query.trim().to_string(),
            response: state.str(RESPONSE).to_string(),
            intent: Some(state.str(INTENT)).filter(|i| !i.is_empty()).map(str::to_string),
            guardrail_triggered: state.bool(GUARDRAIL_TRIGGERED),
            validation: state.deserialize(VALIDATION)?,
            completed_tasks: state.string_list(COMPLETED_TASKS),
            insights: state.object(INSIGHTS).cloned().unwrap_or_default(),
            visited: outcome.visited().into_iter().map(str::to_string).collect(),
            forced_fallback: outcome.forced_fallback.is_some(),
            latency_ms: outcome.duration_ms(),
        };
        info!(
            run_id = %answer.run_id,
            intent = answer.intent.as_deref().unwrap_or("-"),
            tasks = answer.completed_tasks.len(),
            latency_ms = answer.latency_ms,
            "Query answered"
        );
        Ok(answer)
    }
}
