//! CompiledGraph execution engine for running workflow graphs
//!
//! Once a graph is built with [`StateGraph`](crate::StateGraph) and compiled,
//! it becomes a [`CompiledGraph`]: immutable, cheap to clone and safe to share
//! across concurrent runs. Each run owns its own state; nothing is shared
//! between runs except the graph definition and the collaborators captured by
//! its steps.
//!
//! # Overview
//!
//! - **Conditional routing** - routers see the state after the node's update
//! - **Fan-out / join** - branches run concurrently and merge at a barrier
//! - **Bounded cycles** - a cycle past its lap bound forces the fallback
//! - **Cancellation** - a token or deadline stops the run between awaits
//!
//! # Key Types
//!
//! - [`CompiledGraph`] - The executable graph
//! - [`RunConfig`] - Cycle bound and deadline
//! - [`RunOutcome`] - Final state plus the execution trace

mod execution;
mod graph;

pub use execution::{ForcedFallback, RunOutcome, TraceEvent};
pub use graph::{CompiledGraph, RunConfig, DEFAULT_MAX_REENTRIES};
