//! Dynamic fan-out over named retrieval tasks
//!
//! A dispatch node reads a list of task names from state, runs one branch per
//! name concurrently and reports every branch into the graph's completion
//! field. The node's single static edge leads to the join that waits for
//! exactly the tasks that were requested.
//!
//! Each branch writes:
//!
//! - `evidence[<task>]`: the records it found (empty on failure)
//! - `insights["<task>_error"]`: the failure message, only when it failed
//! - `completed_tasks += [<task>]`: always, success or not
//!
//! A failing branch therefore never blocks the join. An empty task list
//! produces no branches and the join fires immediately.

use crate::collaborator::{Record, Retriever, SearchFilter};
use crate::error::{CollaboratorError, GraphError, Result};
use crate::state::{MergePolicy, PartialState, StateSnapshot};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Work performed by one dispatch branch
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &str, query: &str, state: &StateSnapshot) -> std::result::Result<Vec<Record>, CollaboratorError>;
}

/// Handler that forwards the query to a [`Retriever`]
pub struct RetrieverTask {
    retriever: Arc<dyn Retriever>,
    limit: usize,
    filter: Option<SearchFilter>,
}

impl RetrieverTask {
    pub fn new(retriever: Arc<dyn Retriever>, limit: usize) -> Self {
        Self {
            retriever,
            limit,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[async_trait]
impl TaskHandler for RetrieverTask {
    async fn run(&self, _task: &str, query: &str, _state: &StateSnapshot) -> std::result::Result<Vec<Record>, CollaboratorError> {
        self.retriever.search(query, self.limit, self.filter.as_ref()).await
    }
}

/// Result of one dispatch branch, ready to merge
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task: String,
    pub update: PartialState,
    pub failed: bool,
}

/// Task-name to handler table plus the state fields a dispatch node uses
#[derive(Clone)]
pub struct Dispatcher {
    tasks_field: String,
    query_field: String,
    evidence_field: String,
    insights_field: String,
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tasks_field", &self.tasks_field)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            tasks_field: "retrieval_tasks".to_string(),
            query_field: "query".to_string(),
            evidence_field: "evidence".to_string(),
            insights_field: "insights".to_string(),
            handlers: BTreeMap::new(),
        }
    }

    pub fn with_tasks_field(mut self, field: impl Into<String>) -> Self {
        self.tasks_field = field.into();
        self
    }

    pub fn with_query_field(mut self, field: impl Into<String>) -> Self {
        self.query_field = field.into();
        self
    }

    pub fn with_evidence_field(mut self, field: impl Into<String>) -> Self {
        self.evidence_field = field.into();
        self
    }

    pub fn with_insights_field(mut self, field: impl Into<String>) -> Self {
        self.insights_field = field.into();
        self
    }

    /// Register the handler for a task name
    pub fn handler(mut self, task: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(task.into(), handler);
        self
    }

    /// Register a retriever-backed task
    pub fn retriever(self, task: impl Into<String>, retriever: Arc<dyn Retriever>, limit: usize) -> Self {
        self.handler(task, Arc::new(RetrieverTask::new(retriever, limit)))
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Fields the node writes, given the graph's completion field
    pub fn writes(&self, completion_field: &str) -> BTreeSet<String> {
        BTreeSet::from([
            self.evidence_field.clone(),
            self.insights_field.clone(),
            completion_field.to_string(),
        ])
    }

    /// Fields the node touches and the policy each must have (`None`: any)
    pub fn field_policies(&self) -> Vec<(&str, Option<MergePolicy>)> {
        vec![
            (self.tasks_field.as_str(), None),
            (self.query_field.as_str(), None),
            (self.evidence_field.as_str(), Some(MergePolicy::KeyMerge)),
            (self.insights_field.as_str(), Some(MergePolicy::KeyMerge)),
        ]
    }

    /// Requested task names, first occurrence wins
    pub fn requested(&self, snapshot: &StateSnapshot) -> Vec<String> {
        let mut seen = BTreeSet::new();
        snapshot
            .string_list(&self.tasks_field)
            .into_iter()
            .filter(|task| seen.insert(task.clone()))
            .collect()
    }

    /// Run every requested task concurrently and return one report per task
    /// in request order, however the branches finish
    pub async fn dispatch(
        &self,
        node: &str,
        snapshot: &StateSnapshot,
        completion_field: &str,
        token: &CancellationToken,
    ) -> Result<Vec<TaskReport>> {
        let tasks = self.requested(snapshot);
        let query = snapshot.str(&self.query_field);
        debug!(node = %node, tasks = ?tasks, "Dispatching retrieval tasks");

        let mut branches: FuturesUnordered<_> = tasks
            .iter()
            .map(|task| async move {
                let outcome = match self.handlers.get(task) {
                    Some(handler) => handler.run(task, query, snapshot).await,
                    None => Err(CollaboratorError::Unavailable(format!("no handler registered for task '{task}'"))),
                };
                (task.clone(), outcome)
            })
            .collect();

        let mut reports = Vec::with_capacity(tasks.len());
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(GraphError::Cancelled),
                next = branches.next() => match next {
                    Some((task, outcome)) => reports.push(self.report(task, outcome, completion_field)),
                    None => break,
                },
            }
        }
        reports.sort_by_key(|report| tasks.iter().position(|task| *task == report.task));
        Ok(reports)
    }

    fn report(
        &self,
        task: String,
        outcome: std::result::Result<Vec<Record>, CollaboratorError>,
        completion_field: &str,
    ) -> TaskReport {
        let mut update = PartialState::new().set(completion_field, json!([task.as_str()]));
        let failed = match outcome {
            Ok(records) => {
                let items: Vec<Value> = records.iter().map(Record::to_value).collect();
                debug!(task = %task, found = items.len(), "Dispatch branch finished");
                update.insert(&self.evidence_field, json!({ task.clone(): items }));
                false
            }
            Err(err) => {
                warn!(task = %task, error = %err, "Dispatch branch failed");
                update.insert(&self.evidence_field, json!({ task.clone(): [] }));
                update.insert(&self.insights_field, json!({ format!("{task}_error"): err.to_string() }));
                true
            }
        };
        TaskReport { task, update, failed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Fixed(Vec<Record>);

    #[async_trait]
    impl Retriever for Fixed {
        async fn search(&self, _: &str, limit: usize, _: Option<&SearchFilter>) -> std::result::Result<Vec<Record>, CollaboratorError> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
    }

    struct Down;

    #[async_trait]
    impl Retriever for Down {
        async fn search(&self, _: &str, _: usize, _: Option<&SearchFilter>) -> std::result::Result<Vec<Record>, CollaboratorError> {
            Err(CollaboratorError::Unavailable("offline".into()))
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new()
            .retriever("vector", Arc::new(Fixed(vec![Record::new("a"), Record::new("b")])), 1)
            .retriever("web", Arc::new(Down), 5)
    }

    #[tokio::test]
    async fn test_reports_every_requested_task() {
        let snapshot = StateSnapshot::from_value(json!({
            "query": "야시장",
            "retrieval_tasks": ["vector", "web", "vector"],
        }));
        let reports = dispatcher()
            .dispatch("dispatch", &snapshot, "completed_tasks", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);

        let vector = reports.iter().find(|r| r.task == "vector").unwrap();
        assert!(!vector.failed);
        assert_eq!(vector.update.get("evidence"), Some(&json!({"vector": [{"id": "a"}]})));

        let web = reports.iter().find(|r| r.task == "web").unwrap();
        assert!(web.failed);
        assert_eq!(web.update.get("completed_tasks"), Some(&json!(["web"])));
        assert!(web.update.get("insights").unwrap()["web_error"].is_string());
    }

    struct Delayed(Duration);

    #[async_trait]
    impl Retriever for Delayed {
        async fn search(&self, _: &str, _: usize, _: Option<&SearchFilter>) -> std::result::Result<Vec<Record>, CollaboratorError> {
            tokio::time::sleep(self.0).await;
            Ok(vec![Record::new("late")])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_follow_request_order() {
        let dispatcher = Dispatcher::new()
            .retriever("slow", Arc::new(Delayed(Duration::from_millis(100))), 5)
            .retriever("fast", Arc::new(Delayed(Duration::ZERO)), 5)
            .retriever("web", Arc::new(Down), 5);
        let snapshot = StateSnapshot::from_value(json!({"retrieval_tasks": ["slow", "web", "fast"]}));
        let reports = dispatcher
            .dispatch("dispatch", &snapshot, "completed_tasks", &CancellationToken::new())
            .await
            .unwrap();
        let order: Vec<&str> = reports.iter().map(|r| r.task.as_str()).collect();
        assert_eq!(order, vec!["slow", "web", "fast"]);
    }

    #[tokio::test]
    async fn test_unknown_task_is_recorded_not_fatal() {
        let snapshot = StateSnapshot::from_value(json!({"retrieval_tasks": ["telepathy"]}));
        let reports = dispatcher()
            .dispatch("dispatch", &snapshot, "completed_tasks", &CancellationToken::new())
            .await
            .unwrap();
        assert!(reports[0].failed);
    }

    #[tokio::test]
    async fn test_empty_task_list_dispatches_nothing() {
        let snapshot = StateSnapshot::from_value(json!({"retrieval_tasks": []}));
        let reports = dispatcher()
            .dispatch("dispatch", &snapshot, "completed_tasks", &CancellationToken::new())
            .await
            .unwrap();
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_branches_finish() {
        let token = CancellationToken::new();
        token.cancel();
        let snapshot = StateSnapshot::from_value(json!({"retrieval_tasks": ["vector"]}));
        let err = dispatcher()
            .dispatch("dispatch", &snapshot, "completed_tasks", &token)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Cancelled));
    }
}
