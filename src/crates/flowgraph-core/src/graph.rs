//! Core graph data structures and validation
//!
//! This module defines the immutable graph produced by
//! [`StateGraph`](crate::StateGraph): nodes, static and conditional edges, the
//! cycle fallback, and the structural checks run by `compile()`.
//!
//! # Graph Structure
//!
//! ```text
//!  START ──► guardrail ──┬─ blocked ──────────────────────────► format ──► END
//!                        └─ pass ──► plan ──► dispatch ═╦═► collect (join)
//!                                                       ║ one branch per task
//!                                                       ╚═► ...
//! ```
//!
//! - **Nodes** are [`NodeSpec`]s: a name, a [`NodeKind`] and the state fields
//!   the node owns.
//! - **Edges** are either a static [`Edge::Direct`] (several of them from one
//!   node declare a fan-out) or a single [`Edge::Conditional`] whose router
//!   returns one of its declared labels.
//! - [`START`] and [`END`] are reserved markers outside the node namespace.
//!
//! Every invariant that can be checked without running the graph is checked by
//! [`Graph::validate`], so malformed graphs fail before the first request.

use crate::dispatch::Dispatcher;
use crate::error::{StepError, ValidationError};
use crate::state::{MergePolicy, PartialState, StateSchema, StateSnapshot};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Node identifier - unique name for each node in the graph
pub type NodeId = String;

/// Special node identifier for graph entry point
pub const START: &str = "__start__";

/// Special node identifier for graph exit point
pub const END: &str = "__end__";

/// Default state field recording finished fan-out branches
pub const COMPLETED_TASKS: &str = "completed_tasks";

/// Future returned by a step function
pub type StepFuture = Pin<Box<dyn Future<Output = Result<PartialState, StepError>> + Send>>;

/// Step function: reads a snapshot, returns the fields it changes
///
/// ```rust
/// use flowgraph_core::graph::StepFn;
/// use flowgraph_core::state::PartialState;
/// use std::sync::Arc;
///
/// let step: StepFn = Arc::new(|snapshot| {
///     Box::pin(async move {
///         let query = snapshot.str("query").trim().to_string();
///         Ok(PartialState::new().set("query", query))
///     })
/// });
/// ```
pub type StepFn = Arc<dyn Fn(StateSnapshot) -> StepFuture + Send + Sync>;

/// Router for a conditional edge, evaluated on the post-update snapshot
pub type RouterFn = Arc<dyn Fn(&StateSnapshot) -> String + Send + Sync>;

/// What a node does when the executor reaches it
#[derive(Clone)]
pub enum NodeKind {
    /// Ordinary step
    Step(StepFn),
    /// Barrier: runs once every branch recorded by the preceding fan-out has
    /// reported into the completion field
    Join(StepFn),
    /// Dynamic fan-out, one branch per requested task name
    Dispatch(Arc<Dispatcher>),
}

impl NodeKind {
    pub fn is_join(&self) -> bool {
        matches!(self, NodeKind::Join(_))
    }

    pub fn is_dispatch(&self) -> bool {
        matches!(self, NodeKind::Dispatch(_))
    }

    fn label(&self) -> &'static str {
        match self {
            NodeKind::Step(_) => "step",
            NodeKind::Join(_) => "join",
            NodeKind::Dispatch(_) => "dispatch",
        }
    }
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A named node and the state fields it owns
#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub name: NodeId,
    pub kind: NodeKind,
    /// Fields this node may write; anything else fails the run
    pub writes: BTreeSet<String>,
}

/// Outgoing transition from a node
#[derive(Clone)]
pub enum Edge {
    /// Unconditional edge to a specific node (or [`END`])
    Direct(NodeId),

    /// Conditional edge: the router picks exactly one label
    Conditional {
        router: RouterFn,
        /// Label → target, all targets validated at compile time
        labels: BTreeMap<String, NodeId>,
    },
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Edge::Direct(node_id) => f.debug_tuple("Direct").field(node_id).finish(),
            Edge::Conditional { labels, .. } => f
                .debug_struct("Conditional")
                .field("router", &"<function>")
                .field("labels", labels)
                .finish(),
        }
    }
}

/// Immutable graph definition
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: BTreeMap<NodeId, NodeSpec>,
    /// Source node (or [`START`]) → outgoing edges, in declaration order
    pub edges: BTreeMap<NodeId, Vec<Edge>>,
    pub schema: Arc<StateSchema>,
    /// Union field that fan-out branches report into
    pub completion_field: String,
    /// Node forced when a cycle exceeds its lap bound
    pub cycle_fallback: Option<NodeId>,
}

impl Graph {
    pub fn new(schema: Arc<StateSchema>) -> Self {
        Self {
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            schema,
            completion_field: COMPLETED_TASKS.to_string(),
            cycle_fallback: None,
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    pub fn outgoing(&self, name: &str) -> &[Edge] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Static targets of a node, in declaration order
    pub fn direct_targets(&self, name: &str) -> Vec<&str> {
        self.outgoing(name)
            .iter()
            .filter_map(|edge| match edge {
                Edge::Direct(to) => Some(to.as_str()),
                Edge::Conditional { .. } => None,
            })
            .collect()
    }

    /// Every node a transition out of `name` could reach
    pub fn successors(&self, name: &str) -> Vec<&str> {
        let mut out = Vec::new();
        for edge in self.outgoing(name) {
            match edge {
                Edge::Direct(to) => out.push(to.as_str()),
                Edge::Conditional { labels, .. } => out.extend(labels.values().map(String::as_str)),
            }
        }
        out
    }

    fn is_declared_target(&self, name: &str) -> bool {
        name == END || self.nodes.contains_key(name)
    }

    fn is_join(&self, name: &str) -> bool {
        self.nodes.get(name).map(|n| n.kind.is_join()).unwrap_or(false)
    }

    /// Check every structural invariant, reporting the first defect found
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_names()?;
        self.validate_writes()?;
        self.validate_entry()?;
        self.validate_edge_targets()?;
        self.validate_edge_shapes()?;
        self.validate_fan_outs()?;
        self.validate_completion_field()?;
        self.validate_reachability()?;
        self.validate_cycles()?;
        Ok(())
    }

    fn validate_names(&self) -> Result<(), ValidationError> {
        for name in self.nodes.keys() {
            if name == START || name == END || name.starts_with("__") {
                return Err(ValidationError::ReservedName(name.clone()));
            }
        }
        Ok(())
    }

    fn validate_writes(&self) -> Result<(), ValidationError> {
        for node in self.nodes.values() {
            for field in &node.writes {
                if !self.schema.contains(field) {
                    return Err(ValidationError::UnknownField {
                        node: node.name.clone(),
                        field: field.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_entry(&self) -> Result<(), ValidationError> {
        match self.outgoing(START).len() {
            0 => return Err(ValidationError::MissingEntry),
            1 => {}
            n => return Err(ValidationError::MultipleEntries(n)),
        }
        for (from, edges) in &self.edges {
            let into_start = edges.iter().any(|edge| match edge {
                Edge::Direct(to) => to == START,
                Edge::Conditional { labels, .. } => labels.values().any(|to| to == START),
            });
            if into_start {
                return Err(ValidationError::EdgeIntoStart { from: from.clone() });
            }
        }
        Ok(())
    }

    fn validate_edge_targets(&self) -> Result<(), ValidationError> {
        for (from, edges) in &self.edges {
            if from != START && !self.nodes.contains_key(from) {
                return Err(ValidationError::UnknownSource(from.clone()));
            }
            for edge in edges {
                match edge {
                    Edge::Direct(to) => {
                        if !self.is_declared_target(to) {
                            return Err(ValidationError::DanglingEdge {
                                from: from.clone(),
                                to: to.clone(),
                            });
                        }
                    }
                    Edge::Conditional { labels, .. } => {
                        if labels.is_empty() {
                            return Err(ValidationError::EmptyLabelMap(from.clone()));
                        }
                        for (label, to) in labels {
                            if !self.is_declared_target(to) {
                                return Err(ValidationError::DanglingLabel {
                                    from: from.clone(),
                                    label: label.clone(),
                                    to: to.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_edge_shapes(&self) -> Result<(), ValidationError> {
        for (from, edges) in &self.edges {
            let conditional = edges
                .iter()
                .filter(|e| matches!(e, Edge::Conditional { .. }))
                .count();
            if conditional > 1 {
                return Err(ValidationError::MultipleConditionalEdges(from.clone()));
            }
            if conditional == 1 && edges.len() > 1 {
                return Err(ValidationError::MixedEdges(from.clone()));
            }
        }
        for name in self.nodes.keys() {
            if self.outgoing(name).is_empty() {
                return Err(ValidationError::DeadEnd(name.clone()));
            }
        }
        for node in self.nodes.values() {
            if node.kind.is_dispatch() {
                let targets = self.direct_targets(&node.name);
                let wired = self.outgoing(&node.name).len() == 1
                    && targets.len() == 1
                    && self.is_join(targets[0]);
                if !wired {
                    return Err(ValidationError::DispatchWithoutJoin {
                        node: node.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Follow a fan-out branch to its join, collecting the nodes on the way
    pub(crate) fn branch_chain(&self, from: &str, branch: &str) -> Result<(Vec<NodeId>, NodeId), ValidationError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = branch.to_string();
        loop {
            if self.is_join(&current) {
                return Ok((chain, current));
            }
            let without_join = || ValidationError::BranchWithoutJoin {
                from: from.to_string(),
                branch: branch.to_string(),
            };
            let node = self.nodes.get(&current).ok_or_else(without_join)?;
            if !matches!(node.kind, NodeKind::Step(_)) || !seen.insert(current.clone()) {
                return Err(without_join());
            }
            let edges = self.outgoing(&current);
            let next = match edges {
                [Edge::Direct(to)] => to.clone(),
                _ => return Err(without_join()),
            };
            chain.push(current);
            current = next;
        }
    }

    fn validate_fan_outs(&self) -> Result<(), ValidationError> {
        for from in self.edges.keys() {
            let targets = self.direct_targets(from);
            if targets.len() < 2 {
                continue;
            }
            let mut joins = BTreeSet::new();
            let mut owned: Vec<(String, BTreeSet<String>)> = Vec::new();
            for branch in &targets {
                let (chain, join) = self.branch_chain(from, branch)?;
                joins.insert(join);
                let writes: BTreeSet<String> = chain
                    .iter()
                    .filter_map(|n| self.nodes.get(n))
                    .flat_map(|n| n.writes.iter().cloned())
                    .collect();
                owned.push((branch.to_string(), writes));
            }
            if joins.len() > 1 {
                return Err(ValidationError::DivergentJoins {
                    from: from.clone(),
                    joins: joins.into_iter().collect(),
                });
            }
            for (i, (first, first_writes)) in owned.iter().enumerate() {
                for (second, second_writes) in owned.iter().skip(i + 1) {
                    let clash = first_writes.intersection(second_writes).find(|field| {
                        self.schema
                            .policy(field)
                            .map(|p| !p.is_concurrent_safe())
                            .unwrap_or(true)
                    });
                    if let Some(field) = clash {
                        return Err(ValidationError::ConflictingBranchWrites {
                            first: first.clone(),
                            second: second.clone(),
                            field: field.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn has_concurrency(&self) -> bool {
        self.nodes.values().any(|n| n.kind.is_join() || n.kind.is_dispatch())
            || self.edges.keys().any(|from| self.direct_targets(from).len() > 1)
    }

    fn validate_completion_field(&self) -> Result<(), ValidationError> {
        if self.has_concurrency() && self.schema.policy(&self.completion_field) != Some(MergePolicy::Union) {
            return Err(ValidationError::MissingCompletionField(self.completion_field.clone()));
        }
        for node in self.nodes.values() {
            if let NodeKind::Dispatch(dispatcher) = &node.kind {
                for (field, policy) in dispatcher.field_policies() {
                    let ok = match policy {
                        Some(expected) => self.schema.policy(field) == Some(expected),
                        None => self.schema.contains(field),
                    };
                    if !ok {
                        return Err(ValidationError::DispatchFieldPolicy {
                            node: node.name.clone(),
                            field: field.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_reachability(&self) -> Result<(), ValidationError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([START]);
        while let Some(current) = queue.pop_front() {
            if current == END {
                return Ok(());
            }
            if !seen.insert(current) {
                continue;
            }
            queue.extend(self.successors(current));
        }
        Err(ValidationError::UnreachableEnd)
    }

    /// A node that can reach itself, if any
    pub fn find_cycle(&self) -> Option<NodeId> {
        for start in self.nodes.keys() {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut stack: Vec<&str> = self.successors(start);
            while let Some(current) = stack.pop() {
                if current == start.as_str() {
                    return Some(start.clone());
                }
                if current == END || !seen.insert(current) {
                    continue;
                }
                stack.extend(self.successors(current));
            }
        }
        None
    }

    /// Nodes reachable from `name` through one or more edges, `END` excluded
    fn reachable_from(&self, name: &str) -> HashSet<&str> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = self.successors(name);
        while let Some(current) = stack.pop() {
            if current == END || !seen.insert(current) {
                continue;
            }
            stack.extend(self.successors(current));
        }
        seen
    }

    /// Whether [`END`] can be reached from `from` without passing through `avoid`
    fn reaches_end_avoiding(&self, from: &str, avoid: &str) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![from];
        while let Some(current) = stack.pop() {
            if current == END {
                return true;
            }
            if current == avoid || !seen.insert(current) {
                continue;
            }
            stack.extend(self.successors(current));
        }
        false
    }

    /// Conditional edges that start another lap of a cycle
    ///
    /// Maps router → label target → cycle id, the smallest node name of the
    /// strongly connected component both ends belong to. An edge starts a lap
    /// when its target cannot reach [`END`] without coming back through the
    /// router. A cycle with no such edge counts every conditional edge that
    /// stays inside it.
    pub fn cycle_edges(&self) -> BTreeMap<NodeId, BTreeMap<NodeId, NodeId>> {
        let reach: BTreeMap<&str, HashSet<&str>> = self
            .nodes
            .keys()
            .map(|name| (name.as_str(), self.reachable_from(name)))
            .collect();
        // cycle id → (router, target, starts a lap)
        let mut candidates: BTreeMap<NodeId, Vec<(&str, &str, bool)>> = BTreeMap::new();
        for (router, edges) in &self.edges {
            let Some(from_reach) = reach.get(router.as_str()) else {
                continue;
            };
            for edge in edges {
                let Edge::Conditional { labels, .. } = edge else {
                    continue;
                };
                for target in labels.values() {
                    let closes = reach.get(target.as_str()).is_some_and(|r| r.contains(router.as_str()));
                    if !closes {
                        continue;
                    }
                    let cycle = from_reach
                        .iter()
                        .filter(|member| reach.get(*member).is_some_and(|r| r.contains(router.as_str())))
                        .min()
                        .map_or(router.clone(), |member| member.to_string());
                    let lap = target == router || !self.reaches_end_avoiding(target, router);
                    candidates
                        .entry(cycle)
                        .or_default()
                        .push((router.as_str(), target.as_str(), lap));
                }
            }
        }

        let mut cycles: BTreeMap<NodeId, BTreeMap<NodeId, NodeId>> = BTreeMap::new();
        for (cycle, edges) in candidates {
            let any_lap = edges.iter().any(|(_, _, lap)| *lap);
            for (router, target, lap) in edges {
                if lap || !any_lap {
                    cycles
                        .entry(router.to_string())
                        .or_default()
                        .insert(target.to_string(), cycle.clone());
                }
            }
        }
        cycles
    }

    /// A node on a cycle made only of static edges, if any
    pub fn find_static_cycle(&self) -> Option<NodeId> {
        for start in self.nodes.keys() {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut stack: Vec<&str> = self.direct_targets(start);
            while let Some(current) = stack.pop() {
                if current == start.as_str() {
                    return Some(start.clone());
                }
                if current == END || !seen.insert(current) {
                    continue;
                }
                stack.extend(self.direct_targets(current));
            }
        }
        None
    }

    fn validate_cycles(&self) -> Result<(), ValidationError> {
        if let Some(node) = self.find_static_cycle() {
            return Err(ValidationError::StaticCycle(node));
        }
        let fallback = match &self.cycle_fallback {
            Some(fallback) => fallback,
            None => {
                return match self.find_cycle() {
                    Some(node) => Err(ValidationError::MissingFallback(node)),
                    None => Ok(()),
                }
            }
        };
        if !self.nodes.contains_key(fallback) {
            return Err(ValidationError::UnknownFallback(fallback.clone()));
        }
        let mut seen = HashSet::new();
        let mut current = fallback.clone();
        while current != END {
            let not_terminal = |at: &str| ValidationError::FallbackNotTerminal {
                node: fallback.clone(),
                at: at.to_string(),
            };
            let is_step = matches!(self.nodes.get(&current).map(|n| &n.kind), Some(NodeKind::Step(_)));
            if !is_step || !seen.insert(current.clone()) {
                return Err(not_terminal(&current));
            }
            current = match self.outgoing(&current) {
                [Edge::Direct(to)] => to.clone(),
                _ => return Err(not_terminal(&current)),
            };
        }
        Ok(())
    }
}
