//! # flowgraph-core - Schema-checked workflow graphs
//!
//! A small orchestration engine for request pipelines built from async steps:
//! classify, plan, fetch in parallel, grade, retry, answer. A pipeline is a
//! directed graph of named steps over a shared, schema-declared state.
//!
//! ## Overview
//!
//! - **Declared state** - every field has a merge policy, every step declares
//!   the fields it may write
//! - **Conditional routing** - routers pick a labelled edge from the state a
//!   step just produced
//! - **Fan-out / join** - static or task-driven branches run concurrently and
//!   meet at a barrier that fires exactly once
//! - **Bounded cycles** - corrective loops are capped per node and fall back
//!   to a terminal path instead of spinning
//! - **Cancellation** - callers can stop a run with a token or a deadline
//! - **Build-time validation** - malformed graphs are rejected by `compile()`
//!
//! ## Core Concepts
//!
//! ### 1. State
//!
//! [`StateSchema`] fixes the field set. Updates are [`PartialState`]s merged
//! with each field's [`MergePolicy`]:
//!
//! - `Overwrite` for single-writer fields (query, draft, verdicts)
//! - `Union` for ordered, de-duplicated lists (completed task names)
//! - `KeyMerge` for objects that several branches fill in (per-task evidence)
//!
//! ### 2. Graph
//!
//! [`StateGraph`] collects steps, joins, dispatch nodes and edges. Reserved
//! [`START`] and [`END`] markers frame the graph.
//!
//! ### 3. Execution
//!
//! [`CompiledGraph`] runs one request at a time per call, any number of calls
//! concurrently. Runs return the final [`State`], or a [`RunOutcome`] with the
//! step trace.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowgraph_core::{MergePolicy, PartialState, StateGraph, StateSchema, END, START};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let schema = StateSchema::new()
//!         .field("query", MergePolicy::Overwrite)
//!         .field("intent", MergePolicy::Overwrite)
//!         .field("response", MergePolicy::Overwrite);
//!
//!     let mut graph = StateGraph::new(schema);
//!     graph.add_node("classify", ["intent"], |s| {
//!         Box::pin(async move {
//!             let intent = if s.str("query").contains('?') { "question" } else { "chat" };
//!             Ok(PartialState::new().set("intent", intent))
//!         })
//!     });
//!     graph.add_node("answer", ["response"], |_| {
//!         Box::pin(async move { Ok(PartialState::new().set("response", "let me check")) })
//!     });
//!     graph.add_node("chat", ["response"], |_| {
//!         Box::pin(async move { Ok(PartialState::new().set("response", "hello!")) })
//!     });
//!
//!     graph.add_edge(START, "classify");
//!     graph.add_conditional_edge(
//!         "classify",
//!         |s| s.str("intent").to_string(),
//!         [("question", "answer"), ("chat", "chat")],
//!     );
//!     graph.add_edge("answer", END).add_edge("chat", END);
//!
//!     let compiled = graph.compile()?;
//!     let state = compiled.run(PartialState::new().set("query", "open on sunday?")).await?;
//!     println!("{}", state.snapshot().str("response"));
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`state`] - schema, merge policies, partial updates, snapshots
//! - [`graph`] - node and edge definitions, structural validation
//! - [`builder`] - the [`StateGraph`] builder
//! - [`compiled`] - the executor
//! - [`dispatch`] - task-driven fan-out
//! - [`collaborator`] - retrieval and generation contracts
//! - [`visualization`] - Mermaid and DOT rendering
//! - [`error`] - error types

pub mod builder;
pub mod collaborator;
pub mod compiled;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod state;
pub mod visualization;

pub use builder::StateGraph;
pub use collaborator::{ensure_label, Formatter, Generator, Record, Retriever, SearchFilter};
pub use compiled::{CompiledGraph, ForcedFallback, RunConfig, RunOutcome, TraceEvent, DEFAULT_MAX_REENTRIES};
pub use dispatch::{Dispatcher, RetrieverTask, TaskHandler, TaskReport};
pub use error::{CollaboratorError, GraphError, Result, StepError, ValidationError};
pub use graph::{Edge, Graph, NodeId, NodeKind, NodeSpec, RouterFn, StepFn, StepFuture, COMPLETED_TASKS, END, START};
pub use state::{merge_value, MergePolicy, PartialState, State, StateError, StateSchema, StateSnapshot};
pub use visualization::{visualize, VisualizationFormat, VisualizationOptions};

/// Re-exported so callers can cancel runs without a direct dependency
pub use tokio_util::sync::CancellationToken;
