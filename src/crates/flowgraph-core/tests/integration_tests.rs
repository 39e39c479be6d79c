//! Integration tests for complete retrieval workflows
//!
//! These tests drive the public API end to end: a planner writes task names,
//! a dispatch node fans out over retrievers, a join collects the evidence and
//! a grader decides whether to retry through a bounded loop.

use async_trait::async_trait;
use flowgraph_core::{
    CancellationToken, CollaboratorError, Dispatcher, GraphError, MergePolicy, PartialState, Record, Retriever,
    RunConfig, SearchFilter, StateGraph, StateSchema, END, START,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Catalog {
    items: Vec<&'static str>,
    calls: AtomicUsize,
}

impl Catalog {
    fn new(items: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            items,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Retriever for Catalog {
    async fn search(&self, query: &str, limit: usize, _: Option<&SearchFilter>) -> Result<Vec<Record>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .items
            .iter()
            .filter(|name| query.split_whitespace().any(|term| name.contains(term)))
            .take(limit)
            .map(|name| Record::new(*name).with_field("name", *name))
            .collect())
    }
}

struct Offline;

#[async_trait]
impl Retriever for Offline {
    async fn search(&self, _: &str, _: usize, _: Option<&SearchFilter>) -> Result<Vec<Record>, CollaboratorError> {
        Err(CollaboratorError::Unavailable("web lookup has no backend".into()))
    }
}

struct Stalled;

#[async_trait]
impl Retriever for Stalled {
    async fn search(&self, _: &str, _: usize, _: Option<&SearchFilter>) -> Result<Vec<Record>, CollaboratorError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

fn schema() -> StateSchema {
    StateSchema::new()
        .field("query", MergePolicy::Overwrite)
        .field("retrieval_tasks", MergePolicy::Overwrite)
        .field("relevance", MergePolicy::Overwrite)
        .field("rewrite_count", MergePolicy::Overwrite)
        .field("response", MergePolicy::Overwrite)
        .field("completed_tasks", MergePolicy::Union)
        .field("evidence", MergePolicy::KeyMerge)
        .field("insights", MergePolicy::KeyMerge)
}

fn pipeline(dispatcher: Dispatcher) -> StateGraph {
    let mut graph = StateGraph::new(schema());
    graph.add_node("plan", ["retrieval_tasks"], |_| {
        Box::pin(async { Ok(PartialState::new().set("retrieval_tasks", json!(["vector", "web"]))) })
    });
    graph.add_dispatch("dispatch", dispatcher, "collect");
    graph.add_join("collect", ["relevance"], |s| {
        Box::pin(async move {
            let found: usize = s
                .object("evidence")
                .map(|e| e.values().filter_map(|v| v.as_array()).map(Vec::len).sum())
                .unwrap_or(0);
            let relevance = if found > 0 { "relevant" } else { "irrelevant" };
            Ok(PartialState::new().set("relevance", relevance))
        })
    });
    graph.add_node("rewrite", ["query", "rewrite_count"], |s| {
        Box::pin(async move {
            Ok(PartialState::new()
                .set("query", format!("{} 야시장", s.str("query")))
                .set("rewrite_count", s.u64("rewrite_count") + 1))
        })
    });
    graph.add_node("answer", ["response"], |s| {
        Box::pin(async move { Ok(PartialState::new().set("response", format!("found for {}", s.str("query")))) })
    });
    graph.add_node("unavailable", ["response"], |_| {
        Box::pin(async { Ok(PartialState::new().set("response", "no answer")) })
    });

    graph.add_edge(START, "plan").add_edge("plan", "dispatch");
    graph.add_conditional_edge(
        "collect",
        |s| s.str("relevance").to_string(),
        [("relevant", "answer"), ("irrelevant", "rewrite")],
    );
    graph.add_edge("rewrite", "dispatch");
    graph.add_edge("answer", END).add_edge("unavailable", END);
    graph.set_cycle_fallback("unavailable");
    graph
}

#[tokio::test]
async fn test_failed_task_does_not_block_join() {
    let catalog = Catalog::new(vec!["성수 빈티지 마켓"]);
    let dispatcher = Dispatcher::new()
        .retriever("vector", catalog.clone(), 5)
        .retriever("web", Arc::new(Offline), 5);

    let state = pipeline(dispatcher)
        .compile()
        .unwrap()
        .run(PartialState::new().set("query", "빈티지"))
        .await
        .unwrap();
    let snapshot = state.snapshot();

    assert_eq!(snapshot.str("response"), "found for 빈티지");
    assert_eq!(snapshot.string_list("completed_tasks").len(), 2);
    let evidence = snapshot.object("evidence").unwrap();
    assert_eq!(evidence["vector"].as_array().unwrap().len(), 1);
    assert_eq!(evidence["web"], json!([]));
    assert!(snapshot.object("insights").unwrap()["web_error"]
        .as_str()
        .unwrap()
        .contains("no backend"));
}

#[tokio::test]
async fn test_rewrite_loop_recovers() {
    let catalog = Catalog::new(vec!["망원 야시장"]);
    let dispatcher = Dispatcher::new().retriever("vector", catalog.clone(), 5);

    let outcome = pipeline(dispatcher)
        .compile()
        .unwrap()
        .run_traced(PartialState::new().set("query", "심야"), CancellationToken::new())
        .await
        .unwrap();
    let snapshot = outcome.snapshot();

    assert_eq!(snapshot.u64("rewrite_count"), 1);
    assert_eq!(snapshot.str("response"), "found for 심야 야시장");
    assert_eq!(catalog.calls.load(Ordering::SeqCst), 2);
    assert!(outcome.forced_fallback.is_none());
}

#[tokio::test]
async fn test_exhausted_loop_ends_in_fallback() {
    let catalog = Catalog::new(vec![]);
    let dispatcher = Dispatcher::new().retriever("vector", catalog.clone(), 5);

    let outcome = pipeline(dispatcher)
        .compile()
        .unwrap()
        .run_traced(PartialState::new().set("query", "우주 벼룩시장"), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.snapshot().str("response"), "no answer");
    // the default bound allows two rewrites, the third is redirected
    assert_eq!(outcome.snapshot().u64("rewrite_count"), 2);
    assert_eq!(catalog.calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.reentries.get("rewrite"), Some(&2));
    assert_eq!(outcome.visited().last(), Some(&"unavailable"));
    let forced = outcome.forced_fallback.unwrap();
    assert_eq!((forced.from.as_str(), forced.target.as_str()), ("collect", "rewrite"));
}

#[tokio::test]
async fn test_rewrites_match_configured_bound() {
    for max_reentries in 0..4u32 {
        let catalog = Catalog::new(vec![]);
        let dispatcher = Dispatcher::new().retriever("vector", catalog.clone(), 5);

        let state = pipeline(dispatcher)
            .compile_with_config(RunConfig::default().with_max_reentries(max_reentries))
            .unwrap()
            .run(PartialState::new().set("query", "우주 벼룩시장"))
            .await
            .unwrap();

        assert_eq!(state.snapshot().u64("rewrite_count"), u64::from(max_reentries));
        assert_eq!(catalog.calls.load(Ordering::SeqCst), max_reentries as usize + 1);
        assert_eq!(state.snapshot().str("response"), "no answer");
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_dispatch() {
    let dispatcher = Dispatcher::new()
        .retriever("vector", Arc::new(Stalled), 5)
        .retriever("web", Arc::new(Offline), 5);
    let compiled = pipeline(dispatcher).compile().unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        canceller.cancel();
    });

    let err = compiled
        .run_with_cancel(PartialState::new().set("query", "빈티지"), token)
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_during_dispatch() {
    let dispatcher = Dispatcher::new().retriever("vector", Arc::new(Stalled), 5);
    let compiled = pipeline(dispatcher)
        .compile_with_config(RunConfig::default().with_timeout(Duration::from_secs(2)))
        .unwrap();

    let err = compiled.run(PartialState::new().set("query", "빈티지")).await.unwrap_err();
    assert!(matches!(err, GraphError::Timeout { duration_ms: 2000 }));
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let catalog = Catalog::new(vec!["성수 빈티지 마켓", "망원 야시장"]);
    let dispatcher = Dispatcher::new().retriever("vector", catalog, 5);
    let compiled = Arc::new(pipeline(dispatcher).compile().unwrap());

    let handles: Vec<_> = ["빈티지", "야시장"]
        .into_iter()
        .map(|query| {
            let compiled = compiled.clone();
            tokio::spawn(async move { compiled.run(PartialState::new().set("query", query)).await })
        })
        .collect();

    let mut responses = Vec::new();
    for handle in handles {
        let state = handle.await.unwrap().unwrap();
        responses.push(state.snapshot().str("response").to_string());
    }
    assert_eq!(responses, vec!["found for 빈티지", "found for 야시장"]);
}
