//! StateGraph builder API for constructing workflow graphs
//!
//! [`StateGraph`] collects nodes, edges and the cycle fallback, then
//! [`compile`](StateGraph::compile) validates the whole structure and freezes
//! it into a [`CompiledGraph`]. Nothing is checked while building; every
//! defect is reported by `compile()` with the offending node or edge named.
//!
//! # Node Kinds
//!
//! | Method | Node | Runs |
//! |--------|------|------|
//! | [`add_node`](StateGraph::add_node) | step | once per visit |
//! | [`add_join`](StateGraph::add_join) | barrier | after every expected branch reported |
//! | [`add_dispatch`](StateGraph::add_dispatch) | dynamic fan-out | one branch per requested task |
//!
//! Every step declares the fields it writes. Writing anything else fails the
//! run, and `compile()` rejects declarations outside the state schema.
//!
//! # Example
//!
//! ```rust
//! use flowgraph_core::{MergePolicy, PartialState, StateGraph, StateSchema, END, START};
//!
//! let schema = StateSchema::new()
//!     .field("query", MergePolicy::Overwrite)
//!     .field("response", MergePolicy::Overwrite);
//!
//! let mut graph = StateGraph::new(schema);
//! graph.add_node("answer", ["response"], |snapshot| {
//!     Box::pin(async move {
//!         let reply = format!("you asked: {}", snapshot.str("query"));
//!         Ok(PartialState::new().set("response", reply))
//!     })
//! });
//! graph.add_edge(START, "answer");
//! graph.add_edge("answer", END);
//!
//! let compiled = graph.compile().unwrap();
//! assert_eq!(compiled.graph().nodes.len(), 1);
//! ```

use crate::compiled::{CompiledGraph, RunConfig};
use crate::dispatch::Dispatcher;
use crate::error::{Result, StepError, ValidationError};
use crate::graph::{Edge, Graph, NodeId, NodeKind, NodeSpec, StepFn};
use crate::state::{PartialState, StateSchema, StateSnapshot};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Builder for a schema-checked workflow graph
pub struct StateGraph {
    graph: Graph,
    duplicates: Vec<NodeId>,
}

impl StateGraph {
    /// Create a builder over a state schema
    pub fn new(schema: StateSchema) -> Self {
        Self {
            graph: Graph::new(Arc::new(schema)),
            duplicates: Vec::new(),
        }
    }

    /// Use a different Union field for fan-out completion tracking
    pub fn with_completion_field(mut self, field: impl Into<String>) -> Self {
        self.graph.completion_field = field.into();
        self
    }

    fn insert(&mut self, name: NodeId, kind: NodeKind, writes: BTreeSet<String>) {
        if self.graph.nodes.contains_key(&name) {
            self.duplicates.push(name.clone());
        }
        self.graph.nodes.insert(name.clone(), NodeSpec { name, kind, writes });
    }

    /// Add a step node that may write the listed fields
    pub fn add_node<W, S, F>(&mut self, name: impl Into<NodeId>, writes: W, step: F) -> &mut Self
    where
        W: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(StateSnapshot) -> Pin<Box<dyn Future<Output = std::result::Result<PartialState, StepError>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        let writes = writes.into_iter().map(Into::into).collect();
        self.insert(name.into(), NodeKind::Step(Arc::new(step)), writes);
        self
    }

    /// Add a step node from an already shared step function
    pub fn add_step_fn<W, S>(&mut self, name: impl Into<NodeId>, writes: W, step: StepFn) -> &mut Self
    where
        W: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let writes = writes.into_iter().map(Into::into).collect();
        self.insert(name.into(), NodeKind::Step(step), writes);
        self
    }

    /// Add a join node
    ///
    /// The step runs once every branch of the fan-out feeding it has reported
    /// into the completion field.
    pub fn add_join<W, S, F>(&mut self, name: impl Into<NodeId>, writes: W, step: F) -> &mut Self
    where
        W: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(StateSnapshot) -> Pin<Box<dyn Future<Output = std::result::Result<PartialState, StepError>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        let writes = writes.into_iter().map(Into::into).collect();
        self.insert(name.into(), NodeKind::Join(Arc::new(step)), writes);
        self
    }

    /// Add a dispatch node and its static edge to `join`
    pub fn add_dispatch(
        &mut self,
        name: impl Into<NodeId>,
        dispatcher: Dispatcher,
        join: impl Into<NodeId>,
    ) -> &mut Self {
        let name = name.into();
        self.insert(name.clone(), NodeKind::Dispatch(Arc::new(dispatcher)), BTreeSet::new());
        self.add_edge(name, join)
    }

    /// Add a static edge; several from one node declare a fan-out
    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        self.graph
            .edges
            .entry(from.into())
            .or_default()
            .push(Edge::Direct(to.into()));
        self
    }

    /// Add a conditional edge
    ///
    /// `router` sees the snapshot taken after the source node's update and
    /// must return one of the labels in `labels`.
    pub fn add_conditional_edge<F, I, L, T>(&mut self, from: impl Into<NodeId>, router: F, labels: I) -> &mut Self
    where
        F: Fn(&StateSnapshot) -> String + Send + Sync + 'static,
        I: IntoIterator<Item = (L, T)>,
        L: Into<String>,
        T: Into<NodeId>,
    {
        let labels: BTreeMap<String, NodeId> = labels
            .into_iter()
            .map(|(label, to)| (label.into(), to.into()))
            .collect();
        self.graph
            .edges
            .entry(from.into())
            .or_default()
            .push(Edge::Conditional {
                router: Arc::new(router),
                labels,
            });
        self
    }

    /// Node the executor is forced to when a cycle exceeds its lap bound
    pub fn set_cycle_fallback(&mut self, node: impl Into<NodeId>) -> &mut Self {
        self.graph.cycle_fallback = Some(node.into());
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Validate and freeze the graph with default run settings
    pub fn compile(self) -> Result<CompiledGraph> {
        self.compile_with_config(RunConfig::default())
    }

    /// Validate and freeze the graph
    pub fn compile_with_config(mut self, config: RunConfig) -> Result<CompiledGraph> {
        if let Some(name) = self.duplicates.first() {
            return Err(ValidationError::DuplicateNode(name.clone()).into());
        }
        let completion_field = self.graph.completion_field.clone();
        for node in self.graph.nodes.values_mut() {
            if let NodeKind::Dispatch(dispatcher) = &node.kind {
                node.writes = dispatcher.writes(&completion_field);
            }
        }
        self.graph.validate()?;
        Ok(CompiledGraph::new(self.graph, config))
    }
}
