//! Graph execution methods (run, run_with_cancel, run_traced)
//!
//! A run walks the graph one node at a time from [`START`] to [`END`]. After
//! each node the outgoing edge decides what comes next:
//!
//! - a single static edge moves to its target
//! - a conditional edge asks its router, which sees the post-update state
//! - several static edges fan out: every branch runs concurrently on a private
//!   copy of the state, and once all of them finish their updates are merged
//!   in declaration order before the join node runs
//!
//! A conditional edge whose target can reach its router again closes a cycle.
//! Every transition along such an edge is one lap of that cycle. Once a cycle
//! has completed `max_reentries` laps, the next lap is redirected to the
//! graph's cycle fallback, which ends the run through static edges.

use super::CompiledGraph;
use crate::dispatch::Dispatcher;
use crate::error::{GraphError, Result};
use crate::graph::{Edge, Graph, NodeId, NodeKind, NodeSpec, StepFn, END, START};
use crate::state::{MergePolicy, PartialState, State, StateError, StateSchema, StateSnapshot};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// One node execution recorded during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    /// 1-based position in the run
    pub step: usize,
    pub node: String,
    /// Fan-out branch or dispatch task this execution belonged to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Fields the node's update wrote
    pub writes: Vec<String>,
}

/// Where the cycle bound redirected a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForcedFallback {
    /// Node whose outgoing edge was redirected
    pub from: String,
    /// Node the edge asked for
    pub target: String,
    pub fallback: String,
}

/// Final state of a finished run plus how it got there
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: State,
    pub trace: Vec<TraceEvent>,
    /// Laps taken per cycle, keyed by the node each cycle edge enters
    pub reentries: BTreeMap<String, u32>,
    pub forced_fallback: Option<ForcedFallback>,
}

impl RunOutcome {
    /// Number of node executions, branches included
    pub fn steps(&self) -> usize {
        self.trace.len()
    }

    /// Node names in execution order, consecutive repeats collapsed
    pub fn visited(&self) -> Vec<&str> {
        let mut path: Vec<&str> = Vec::new();
        for event in &self.trace {
            if path.last() != Some(&event.node.as_str()) {
                path.push(&event.node);
            }
        }
        path
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

impl CompiledGraph {
    /// Run the graph to completion and return the final state
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use flowgraph_core::{MergePolicy, PartialState, StateGraph, StateSchema, END, START};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut graph = StateGraph::new(StateSchema::new().field("count", MergePolicy::Overwrite));
    /// graph.add_node("bump", ["count"], |snapshot| {
    ///     Box::pin(async move { Ok(PartialState::new().set("count", snapshot.u64("count") + 1)) })
    /// });
    /// graph.add_edge(START, "bump").add_edge("bump", END);
    ///
    /// let state = graph.compile()?.run(PartialState::new().set("count", 41)).await?;
    /// assert_eq!(state.get("count"), Some(&serde_json::json!(42)));
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run(&self, initial: PartialState) -> Result<State> {
        self.run_with_cancel(initial, CancellationToken::new()).await
    }

    /// Run the graph, stopping early if `token` is cancelled
    ///
    /// Cancellation is observed while any step or branch is pending. Partial
    /// branch results are discarded and [`GraphError::Cancelled`] is returned.
    pub async fn run_with_cancel(&self, initial: PartialState, token: CancellationToken) -> Result<State> {
        self.run_traced(initial, token).await.map(|outcome| outcome.state)
    }

    /// Run the graph and return the final state together with its trace
    pub async fn run_traced(&self, initial: PartialState, token: CancellationToken) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let state = State::from_fields(self.graph.schema.clone(), &initial).map_err(|e| GraphError::state(START, e))?;

        // A deadline cancels the run's own token, never the caller's
        let run_token = token.child_token();
        let mut frame = ExecutionFrame::new(
            &self.graph,
            &self.cycle_edges,
            self.config.max_reentries,
            state,
            run_token.clone(),
        );
        let span = tracing::info_span!("graph_run", %run_id, node_count = self.graph.nodes.len());
        let drive = frame.drive().instrument(span);

        let result = match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, drive).await {
                Ok(result) => result,
                Err(_) => {
                    run_token.cancel();
                    let duration_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(%run_id, duration_ms, "Graph run timed out");
                    Err(GraphError::Timeout { duration_ms })
                }
            },
            None => drive.await,
        };
        if let Err(e) = result {
            tracing::error!(%run_id, error = %e, "Graph run failed");
            return Err(e);
        }

        let outcome = frame.finish(run_id, started_at);
        tracing::info!(
            %run_id,
            steps = outcome.steps(),
            forced_fallback = outcome.forced_fallback.is_some(),
            "Graph run completed"
        );
        Ok(outcome)
    }
}

enum Next {
    One(String),
    FanOut(Vec<String>),
}

/// Mutable bookkeeping for a single run
struct ExecutionFrame<'g> {
    graph: &'g Graph,
    cycle_edges: &'g BTreeMap<NodeId, BTreeMap<NodeId, NodeId>>,
    max_reentries: u32,
    state: State,
    token: CancellationToken,
    /// Cycle id → laps taken
    laps: HashMap<NodeId, u32>,
    reentries: BTreeMap<String, u32>,
    /// Join node → branch identifiers it must see in the completion field
    pending_joins: HashMap<String, Vec<String>>,
    trace: Vec<TraceEvent>,
    forced_fallback: Option<ForcedFallback>,
}

impl<'g> ExecutionFrame<'g> {
    fn new(
        graph: &'g Graph,
        cycle_edges: &'g BTreeMap<NodeId, BTreeMap<NodeId, NodeId>>,
        max_reentries: u32,
        state: State,
        token: CancellationToken,
    ) -> Self {
        Self {
            graph,
            cycle_edges,
            max_reentries,
            state,
            token,
            laps: HashMap::new(),
            reentries: BTreeMap::new(),
            pending_joins: HashMap::new(),
            trace: Vec::new(),
            forced_fallback: None,
        }
    }

    async fn drive(&mut self) -> Result<()> {
        tracing::debug!("Starting graph run");
        let mut from = START.to_string();
        loop {
            if self.token.is_cancelled() {
                return Err(GraphError::Cancelled);
            }
            let current = match self.route(&from)? {
                Next::One(target) => self.transition(&from, target),
                Next::FanOut(branches) => self.fan_out(&from, &branches).await?,
            };
            if current == END {
                return Ok(());
            }
            self.execute(&current).await?;
            from = current;
        }
    }

    fn route(&self, from: &str) -> Result<Next> {
        match self.graph.outgoing(from) {
            [Edge::Conditional { router, labels }] => {
                let label = router(&self.state.snapshot());
                match labels.get(&label) {
                    Some(target) => {
                        tracing::debug!(from, label = %label, target = %target, "Conditional route");
                        Ok(Next::One(target.clone()))
                    }
                    None => Err(GraphError::Routing {
                        node: from.to_string(),
                        label,
                        expected: labels.keys().cloned().collect(),
                    }),
                }
            }
            [Edge::Direct(target)] => Ok(Next::One(target.clone())),
            _ => {
                let targets = self.graph.direct_targets(from);
                if targets.len() > 1 {
                    Ok(Next::FanOut(targets.into_iter().map(str::to_string).collect()))
                } else {
                    Err(GraphError::node_execution(from, "node has no usable outgoing edge"))
                }
            }
        }
    }

    /// Apply the cycle bound to a transition
    fn transition(&mut self, from: &str, target: String) -> String {
        if target == END || self.forced_fallback.is_some() {
            return target;
        }
        let cycle_edges = self.cycle_edges;
        let Some(cycle) = cycle_edges.get(from).and_then(|targets| targets.get(&target)) else {
            return target;
        };
        let laps = self.laps.entry(cycle.clone()).or_insert(0);
        if *laps < self.max_reentries {
            *laps += 1;
            *self.reentries.entry(target.clone()).or_insert(0) += 1;
            tracing::debug!(cycle = %cycle, node = %target, laps = *laps, "Taking another lap");
            return target;
        }
        let Some(fallback) = self.graph.cycle_fallback.clone() else {
            return target;
        };
        tracing::warn!(
            from,
            target = %target,
            fallback = %fallback,
            max_reentries = self.max_reentries,
            "Cycle bound exceeded, forcing cycle fallback"
        );
        self.forced_fallback = Some(ForcedFallback {
            from: from.to_string(),
            target,
            fallback: fallback.clone(),
        });
        fallback
    }

    async fn execute(&mut self, name: &str) -> Result<()> {
        let graph = self.graph;
        let node = graph
            .node(name)
            .ok_or_else(|| GraphError::node_execution(name, "node is not part of the graph"))?;

        match &node.kind {
            NodeKind::Step(step) => {
                let update = call_step(&node.name, step, self.state.snapshot(), &self.token).await?;
                self.commit(node, update)
            }
            NodeKind::Join(step) => {
                self.check_barrier(name)?;
                let update = call_step(&node.name, step, self.state.snapshot(), &self.token).await?;
                self.commit(node, update)
            }
            NodeKind::Dispatch(dispatcher) => self.dispatch(node, dispatcher).await,
        }
    }

    fn commit(&mut self, node: &NodeSpec, update: PartialState) -> Result<()> {
        check_writes(node, &update)?;
        self.state
            .apply(&update)
            .map_err(|e| GraphError::state(&node.name, e))?;
        self.record(&node.name, None, &update);
        Ok(())
    }

    fn record(&mut self, node: &str, branch: Option<&str>, update: &PartialState) {
        let writes: Vec<String> = update.fields().map(str::to_string).collect();
        tracing::debug!(node, branch = ?branch, writes = ?writes, "Step applied");
        self.trace.push(TraceEvent {
            step: self.trace.len() + 1,
            node: node.to_string(),
            branch: branch.map(str::to_string),
            writes,
        });
    }

    fn check_barrier(&mut self, join: &str) -> Result<()> {
        let expected = self.pending_joins.remove(join).unwrap_or_default();
        let completed: BTreeSet<&str> = self
            .state
            .get(&self.graph.completion_field)
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        let missing: Vec<String> = expected
            .into_iter()
            .filter(|branch| !completed.contains(branch.as_str()))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(GraphError::Join {
                node: join.to_string(),
                missing,
            })
        }
    }

    async fn dispatch(&mut self, node: &NodeSpec, dispatcher: &Dispatcher) -> Result<()> {
        let graph = self.graph;
        let snapshot = self.state.snapshot();
        let reports = dispatcher
            .dispatch(&node.name, &snapshot, &graph.completion_field, &self.token)
            .await?;

        let mut guard = KeyGuard::default();
        for report in &reports {
            guard
                .claim(&graph.schema, &report.task, &report.update)
                .map_err(|e| GraphError::state(&node.name, e))?;
            check_writes(node, &report.update)?;
            self.state
                .apply(&report.update)
                .map_err(|e| GraphError::state(&node.name, e))?;
            self.record(&node.name, Some(report.task.as_str()), &report.update);
        }
        if reports.is_empty() {
            self.record(&node.name, None, &PartialState::new());
        }

        let failed = reports.iter().filter(|r| r.failed).count();
        tracing::info!(node = %node.name, tasks = reports.len(), failed, "Dispatch complete");

        if let Some(join) = graph.direct_targets(&node.name).first() {
            self.pending_joins.insert(join.to_string(), dispatcher.requested(&snapshot));
        }
        Ok(())
    }

    /// Run static fan-out branches concurrently, merge them in declaration order, return the join
    async fn fan_out(&mut self, from: &str, branches: &[String]) -> Result<String> {
        let graph = self.graph;
        let snapshot = self.state.snapshot();
        tracing::debug!(from, branches = ?branches, "Fanning out");

        let mut pending: FuturesUnordered<_> = branches
            .iter()
            .map(|branch| run_branch(graph, branch.clone(), snapshot.clone(), self.token.clone()))
            .collect();

        let mut finished: HashMap<String, BranchRun> = HashMap::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(GraphError::Cancelled),
                next = pending.next() => next,
            };
            let Some(result) = next else { break };
            let run = result?;
            finished.insert(run.branch.clone(), run);
        }

        let mut guard = KeyGuard::default();
        let mut join = None;
        for run in branches.iter().filter_map(|branch| finished.remove(branch)) {
            guard
                .claim(&graph.schema, &run.branch, &run.update)
                .map_err(|e| GraphError::state(&run.branch, e))?;
            self.state
                .apply(&run.update)
                .map_err(|e| GraphError::state(&run.branch, e))?;
            for (node, writes) in run.events {
                self.trace.push(TraceEvent {
                    step: self.trace.len() + 1,
                    node,
                    branch: Some(run.branch.clone()),
                    writes,
                });
            }
            join = Some(run.join);
        }

        let join = join.ok_or_else(|| GraphError::node_execution(from, "fan-out produced no branches"))?;
        self.pending_joins.insert(join.clone(), branches.to_vec());
        Ok(join)
    }

    fn finish(self, run_id: Uuid, started_at: DateTime<Utc>) -> RunOutcome {
        RunOutcome {
            run_id,
            started_at,
            finished_at: Utc::now(),
            state: self.state,
            trace: self.trace,
            reentries: self.reentries,
            forced_fallback: self.forced_fallback,
        }
    }
}

async fn call_step(name: &str, step: &StepFn, snapshot: StateSnapshot, token: &CancellationToken) -> Result<PartialState> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(GraphError::Cancelled),
        result = step(snapshot) => result.map_err(|e| GraphError::node_execution(name, e.to_string())),
    }
}

fn check_writes(node: &NodeSpec, update: &PartialState) -> Result<()> {
    match update.fields().find(|field| !node.writes.contains(*field)) {
        Some(field) => Err(GraphError::state(&node.name, StateError::UndeclaredWrite(field.to_string()))),
        None => Ok(()),
    }
}

/// Output of one static fan-out branch
struct BranchRun {
    branch: String,
    join: String,
    update: PartialState,
    events: Vec<(String, Vec<String>)>,
}

async fn run_branch(graph: &Graph, branch: String, snapshot: StateSnapshot, token: CancellationToken) -> Result<BranchRun> {
    let mut local = State::from_snapshot(graph.schema.clone(), &snapshot);
    let mut update = PartialState::new();
    let mut events = Vec::new();
    let mut current = branch.clone();

    loop {
        let node = graph
            .node(&current)
            .ok_or_else(|| GraphError::node_execution(&current, "node is not part of the graph"))?;
        let step = match &node.kind {
            NodeKind::Join(_) => break,
            NodeKind::Step(step) => step,
            NodeKind::Dispatch(_) => {
                return Err(GraphError::node_execution(&current, "dispatch nodes cannot run inside a fan-out branch"))
            }
        };
        let output = call_step(&node.name, step, local.snapshot(), &token).await?;
        check_writes(node, &output)?;
        local.apply(&output).map_err(|e| GraphError::state(&node.name, e))?;
        update
            .absorb(&graph.schema, &output)
            .map_err(|e| GraphError::state(&node.name, e))?;
        events.push((node.name.clone(), output.fields().map(str::to_string).collect()));

        current = match graph.direct_targets(&current).as_slice() {
            [next] => next.to_string(),
            _ => return Err(GraphError::node_execution(&current, "branch node needs exactly one static edge")),
        };
    }

    let done = PartialState::new().set(&graph.completion_field, json!([branch.as_str()]));
    update
        .absorb(&graph.schema, &done)
        .map_err(|e| GraphError::state(&branch, e))?;
    Ok(BranchRun {
        branch,
        join: current,
        update,
        events,
    })
}

/// Tracks which branch first wrote each key of key-merged fields
#[derive(Default)]
struct KeyGuard {
    owners: HashMap<(String, String), String>,
}

impl KeyGuard {
    fn claim(&mut self, schema: &StateSchema, branch: &str, update: &PartialState) -> std::result::Result<(), StateError> {
        for (field, value) in update.iter() {
            if schema.policy(field) != Some(MergePolicy::KeyMerge) {
                continue;
            }
            let Some(object) = value.as_object() else { continue };
            for key in object.keys() {
                match self.owners.entry((field.clone(), key.clone())) {
                    Entry::Occupied(owner) if owner.get() != branch => {
                        return Err(StateError::KeyCollision {
                            field: field.clone(),
                            key: key.clone(),
                        })
                    }
                    Entry::Occupied(_) => {}
                    Entry::Vacant(slot) => {
                        slot.insert(branch.to_string());
                    }
                }
            }
        }
        Ok(())
    }
}
