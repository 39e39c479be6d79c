//! CompiledGraph struct and run configuration

use crate::graph::{Graph, NodeId};
use crate::visualization::{self, VisualizationOptions};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Laps allowed per cycle before the cycle fallback is forced
pub const DEFAULT_MAX_REENTRIES: u32 = 2;

/// Per-run execution limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    /// Laps allowed per cycle, counted on conditional edges that stay inside it
    pub max_reentries: u32,
    /// Whole-run deadline; `None` runs until completion or cancellation
    pub timeout: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_reentries: DEFAULT_MAX_REENTRIES,
            timeout: None,
        }
    }
}

impl RunConfig {
    pub fn with_max_reentries(mut self, max_reentries: u32) -> Self {
        self.max_reentries = max_reentries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Compiled graph ready for execution
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub(crate) graph: Arc<Graph>,
    pub(crate) config: RunConfig,
    /// Router → target → cycle id, see [`Graph::cycle_edges`]
    pub(crate) cycle_edges: Arc<BTreeMap<NodeId, BTreeMap<NodeId, NodeId>>>,
}

impl CompiledGraph {
    /// Create a new compiled graph from a validated definition
    pub(crate) fn new(graph: Graph, config: RunConfig) -> Self {
        Self {
            cycle_edges: Arc::new(graph.cycle_edges()),
            graph: Arc::new(graph),
            config,
        }
    }

    /// Replace the run configuration
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Get the underlying graph structure
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Render the graph as a Mermaid flowchart
    pub fn to_mermaid(&self) -> String {
        visualization::visualize(&self.graph, &VisualizationOptions::default())
    }

    /// Render the graph with explicit options
    pub fn visualize(&self, options: &VisualizationOptions) -> String {
        visualization::visualize(&self.graph, options)
    }
}
