//! The chatbot workflow graph
//!
//! ```text
//! START → guardrail ─┬─ blocked ──────────────────────────────────→ format → END
//!                    └─ pass → classify ─┬─ smalltalk → small_talk ─→ format
//!                                        └─ market → plan → dispatch ⇉ collect
//! collect → grade_relevance ─┬─ relevant / no_results → draft
//!                            └─ irrelevant → rewrite → dispatch   (bounded)
//! draft → grade_answer ─┬─ grounded → validate
//!                       └─ hallucinated → rewrite             (same bound)
//! validate ─┬─ pass → format
//!           └─ fail → correct → format
//! unavailable → END                                      (cycle fallback)
//! ```
//!
//! Both ways back into `rewrite` share one lap counter, so a run rewrites at
//! most `max_reentries` times before it ends in `unavailable`.
//!
//! Steps hold no state of their own. Everything they need beyond the run
//! state lives in one shared [`WorkflowContext`] built at startup.

use crate::dataset::SeedDataset;
use crate::error::Result;
use crate::formatting::{ConsumerFormatter, SellerFormatter};
use crate::guardrails::{GuardrailVerdict, Guardrails};
use crate::planner::{self, INTENT_MARKET, INTENT_SMALLTALK, TASK_METADATA, TASK_SELLER_GUIDE, TASK_VECTOR, TASK_WEB};
use crate::retrieval::{MetadataScan, SeedRetriever, SellerGuide};
use crate::schema::*;
use crate::settings::Settings;
use crate::steps::Step;
use crate::validation::{self, ValidationStatus, ValidationVerdict};
use flowgraph_core::{
    CompiledGraph, Dispatcher, Formatter, Generator, PartialState, Retriever, StateGraph, StateSnapshot, StepError,
    StepFn, StepFuture, END, START,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const UNAVAILABLE_RESPONSE: &str = "지금은 알맞은 답변을 찾지 못했어요. 질문을 조금 바꿔서 다시 물어봐 주세요.";
pub const GUIDANCE_NOTE: &str = "조금 더 구체적인 지역이나 분위기를 알려주시면 더 잘 찾아드릴게요.";
const SMALL_TALK_FALLBACK: &str = "안녕하세요! 광주 플리마켓이나 팝업 추천이 필요하면 언제든 말씀해 주세요.";

const RELEVANT: &str = "relevant";
const IRRELEVANT: &str = "irrelevant";
const NO_RESULTS: &str = "no_results";
const GROUNDED: &str = "grounded";
const HALLUCINATED: &str = "hallucinated";
const CORRECTION_KEY: &str = "correction";

type StepResult = std::result::Result<PartialState, StepError>;

/// External services the steps call
#[derive(Clone)]
pub struct Collaborators {
    /// Backs the `vector` task and corrective searches for shoppers
    pub markets: Arc<dyn Retriever>,
    pub metadata: Arc<dyn Retriever>,
    pub seller_guide: Arc<dyn Retriever>,
    /// No default backend; an unset web task is reported as unavailable
    pub web: Option<Arc<dyn Retriever>>,
    pub generator: Arc<dyn Generator>,
}

impl Collaborators {
    /// Seed-backed retrievers plus the given generator
    pub fn seeded(dataset: Arc<SeedDataset>, generator: Arc<dyn Generator>) -> Self {
        Self {
            markets: Arc::new(SeedRetriever::new(dataset.clone())),
            metadata: Arc::new(MetadataScan::new(dataset.clone())),
            seller_guide: Arc::new(SellerGuide::new(dataset)),
            web: None,
            generator,
        }
    }

    pub fn with_web(mut self, web: Arc<dyn Retriever>) -> Self {
        self.web = Some(web);
        self
    }
}

/// Shared, read-only dependencies of every step
pub struct WorkflowContext {
    dataset: Arc<SeedDataset>,
    guardrails: Guardrails,
    collaborators: Collaborators,
    max_results: usize,
    min_coverage: f64,
}

impl WorkflowContext {
    pub fn new(settings: &Settings, dataset: Arc<SeedDataset>, collaborators: Collaborators) -> Result<Self> {
        Ok(Self {
            guardrails: Guardrails::new(&dataset.guardrails)?,
            dataset,
            collaborators,
            max_results: settings.max_results,
            min_coverage: settings.min_coverage,
        })
    }

    fn dispatcher(&self) -> Dispatcher {
        let limit = self.max_results;
        let c = &self.collaborators;
        let dispatcher = Dispatcher::new()
            .retriever(TASK_VECTOR, c.markets.clone(), limit)
            .retriever(TASK_METADATA, c.metadata.clone(), limit)
            .retriever(TASK_SELLER_GUIDE, c.seller_guide.clone(), limit);
        match &c.web {
            Some(web) => dispatcher.retriever(TASK_WEB, web.clone(), limit),
            None => dispatcher,
        }
    }
}

/// Build and validate the workflow graph
pub fn compile_workflow(settings: &Settings, ctx: Arc<WorkflowContext>) -> Result<CompiledGraph> {
    Ok(workflow_graph(&ctx).compile_with_config(settings.run_config())?)
}

/// Assemble the uncompiled graph
pub fn workflow_graph(ctx: &Arc<WorkflowContext>) -> StateGraph {
    let mut graph = StateGraph::new(market_schema());
    for step in Step::ALL {
        match (step, resolve(step, ctx)) {
            (Step::Collect, Some(join)) => {
                graph.add_join(step.as_str(), step.writes().iter().copied(), move |s| join(s));
            }
            (_, Some(run)) => {
                graph.add_step_fn(step.as_str(), step.writes().iter().copied(), run);
            }
            (_, None) => {
                graph.add_dispatch(step.as_str(), ctx.dispatcher(), Step::Collect.as_str());
            }
        }
    }

    graph.add_edge(START, Step::Guardrail.as_str());
    graph.add_conditional_edge(
        Step::Guardrail.as_str(),
        |s| (if s.bool(GUARDRAIL_TRIGGERED) { "blocked" } else { "pass" }).to_string(),
        [("blocked", Step::Format.as_str()), ("pass", Step::Classify.as_str())],
    );
    graph.add_conditional_edge(
        Step::Classify.as_str(),
        |s| s.str(INTENT).to_string(),
        [(INTENT_SMALLTALK, Step::SmallTalk.as_str()), (INTENT_MARKET, Step::Plan.as_str())],
    );
    graph.add_edge(Step::SmallTalk.as_str(), Step::Format.as_str());
    graph.add_edge(Step::Plan.as_str(), Step::Dispatch.as_str());
    graph.add_edge(Step::Collect.as_str(), Step::GradeRelevance.as_str());
    graph.add_conditional_edge(
        Step::GradeRelevance.as_str(),
        |s| s.str(RELEVANCE).to_string(),
        [
            (RELEVANT, Step::Draft.as_str()),
            (NO_RESULTS, Step::Draft.as_str()),
            (IRRELEVANT, Step::Rewrite.as_str()),
        ],
    );
    graph.add_edge(Step::Rewrite.as_str(), Step::Dispatch.as_str());
    graph.add_edge(Step::Draft.as_str(), Step::GradeAnswer.as_str());
    graph.add_conditional_edge(
        Step::GradeAnswer.as_str(),
        |s| s.str(FAITHFULNESS).to_string(),
        [(GROUNDED, Step::Validate.as_str()), (HALLUCINATED, Step::Rewrite.as_str())],
    );
    graph.add_conditional_edge(
        Step::Validate.as_str(),
        |s| (if verdict(s).is_some_and(|v| v.passed()) { "pass" } else { "fail" }).to_string(),
        [("pass", Step::Format.as_str()), ("fail", Step::Correct.as_str())],
    );
    graph.add_edge(Step::Correct.as_str(), Step::Format.as_str());
    graph.add_edge(Step::Format.as_str(), END);
    graph.add_edge(Step::Unavailable.as_str(), END);
    graph.set_cycle_fallback(Step::Unavailable.as_str());
    graph
}

/// Step function for a variant; `None` for the dispatch node, which the
/// engine runs itself
fn resolve(step: Step, ctx: &Arc<WorkflowContext>) -> Option<StepFn> {
    let run = match step {
        Step::Guardrail => step_fn(ctx, guardrail),
        Step::Classify => step_fn(ctx, classify),
        Step::SmallTalk => step_fn(ctx, small_talk),
        Step::Plan => step_fn(ctx, plan),
        Step::Dispatch => return None,
        Step::Collect => step_fn(ctx, collect),
        Step::GradeRelevance => step_fn(ctx, grade_relevance),
        Step::Rewrite => step_fn(ctx, rewrite),
        Step::Draft => step_fn(ctx, draft),
        Step::GradeAnswer => step_fn(ctx, grade_answer),
        Step::Validate => step_fn(ctx, validate),
        Step::Correct => step_fn(ctx, correct),
        Step::Format => step_fn(ctx, format_response),
        Step::Unavailable => step_fn(ctx, unavailable),
    };
    Some(run)
}

fn step_fn<F, Fut>(ctx: &Arc<WorkflowContext>, f: F) -> StepFn
where
    F: Fn(Arc<WorkflowContext>, StateSnapshot) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    let ctx = ctx.clone();
    Arc::new(move |snapshot: StateSnapshot| -> StepFuture { Box::pin(f(ctx.clone(), snapshot)) })
}

async fn guardrail(ctx: Arc<WorkflowContext>, s: StateSnapshot) -> StepResult {
    let update = match ctx.guardrails.check(s.str(QUERY)) {
        GuardrailVerdict::Pass => PartialState::new().set(GUARDRAIL_TRIGGERED, false),
        GuardrailVerdict::Blocked { reason, response } => {
            info!(reason = %reason, "Guardrail blocked request");
            PartialState::new()
                .set(GUARDRAIL_TRIGGERED, true)
                .set(GUARDRAIL_REASON, reason)
                .set(SPECIAL_RESPONSE, response)
        }
    };
    Ok(update)
}

async fn classify(ctx: Arc<WorkflowContext>, s: StateSnapshot) -> StepResult {
    let query = s.str(QUERY);
    let labels = [INTENT_MARKET, INTENT_SMALLTALK];
    let update = match ctx.collaborators.generator.classify(query, &labels).await {
        Ok(intent) => PartialState::new().set(INTENT, intent),
        Err(e) => {
            warn!(error = %e, "Intent classification failed, using keywords");
            PartialState::new()
                .set(INTENT, planner::heuristic_intent(query))
                .set(INSIGHTS, json!({ "classify_error": e.to_string() }))
        }
    };
    Ok(update)
}

async fn small_talk(ctx: Arc<WorkflowContext>, s: StateSnapshot) -> StepResult {
    let prompt = format!(
        "당신은 광주광역시 플리마켓 안내 챗봇입니다. 사용자의 말에 한 문장으로 짧게 답하세요.\n사용자: {}",
        s.str(QUERY)
    );
    let update = match ctx.collaborators.generator.generate(&prompt).await {
        Ok(reply) => {
            let reply = first_line(&reply).unwrap_or(SMALL_TALK_FALLBACK);
            PartialState::new().set(SPECIAL_RESPONSE, reply)
        }
        Err(e) => {
            debug!(error = %e, "Small talk generation unavailable");
            PartialState::new()
                .set(SPECIAL_RESPONSE, SMALL_TALK_FALLBACK)
                .set(INSIGHTS, json!({ "small_talk_error": e.to_string() }))
        }
    };
    Ok(update)
}

async fn plan(ctx: Arc<WorkflowContext>, s: StateSnapshot) -> StepResult {
    let query = s.str(QUERY);
    let tasks = planner::plan_tasks(query, role_of(&s), &ctx.dataset);
    debug!(tasks = ?tasks, "Retrieval planned");
    Ok(PartialState::new()
        .set(RETRIEVAL_TASKS, json!(tasks))
        .set(ORIGINAL_QUERY, query))
}

/// Join: merge the evidence the role cares about into `context_items`
async fn collect(ctx: Arc<WorkflowContext>, s: StateSnapshot) -> StepResult {
    let tasks = s.string_list(RETRIEVAL_TASKS);
    let sources: Vec<&str> = match role_of(&s) {
        Role::Seller => vec![TASK_SELLER_GUIDE],
        Role::Consumer => tasks
            .iter()
            .map(String::as_str)
            .filter(|task| *task != TASK_SELLER_GUIDE)
            .collect(),
    };
    let evidence = s.object(EVIDENCE);
    let batches = sources
        .iter()
        .filter_map(|task| evidence.and_then(|e| e.get(*task)).and_then(Value::as_array));
    let items = merge_items(batches, ctx.max_results);
    debug!(items = items.len(), "Evidence collected");
    Ok(PartialState::new().set(CONTEXT_ITEMS, Value::Array(items)))
}

async fn grade_relevance(ctx: Arc<WorkflowContext>, s: StateSnapshot) -> StepResult {
    let items = context_items(&s);
    if items.is_empty() {
        return Ok(PartialState::new().set(RELEVANCE, NO_RESULTS));
    }

    let candidates: Vec<String> = items.iter().map(describe_item).collect();
    let prompt = format!(
        "질문: {}\n\n후보:\n{}\n\n후보가 질문에 답하는 데 도움이 되면 relevant, 아니면 irrelevant로 답하세요.",
        s.str(QUERY),
        candidates.join("\n")
    );
    let update = match ctx.collaborators.generator.classify(&prompt, &[RELEVANT, IRRELEVANT]).await {
        Ok(label) => PartialState::new().set(RELEVANCE, label),
        Err(e) => {
            warn!(error = %e, "Relevance grading failed, keeping results");
            PartialState::new()
                .set(RELEVANCE, RELEVANT)
                .set(INSIGHTS, json!({ "grade_error": e.to_string() }))
        }
    };
    Ok(update)
}

async fn rewrite(ctx: Arc<WorkflowContext>, s: StateSnapshot) -> StepResult {
    let query = s.str(QUERY);
    let prompt = format!(
        "마켓 추천을 요청한 사용자의 질문을 더 명확하게 만들도록 재작성해 주세요. 재작성한 질문만 답하세요.\n질문: {query}"
    );
    let count = s.u64(REWRITE_COUNT) + 1;
    let mut update = PartialState::new().set(REWRITE_COUNT, count);
    let rewritten = match ctx.collaborators.generator.generate(&prompt).await {
        Ok(text) => first_line(&text).map(str::to_string),
        Err(e) => {
            update.insert(INSIGHTS, json!({ "rewrite_error": e.to_string() }));
            None
        }
    };
    let rewritten = rewritten.unwrap_or_else(|| format!("{query} 플리마켓 추천"));
    info!(attempt = count, query = %rewritten, "Query rewritten");
    Ok(update.set(QUERY, rewritten))
}

/// Write the answer from the collected items, or the role's template without a model
async fn draft(ctx: Arc<WorkflowContext>, s: StateSnapshot) -> StepResult {
    let items = context_items(&s);
    let template = || formatter(role_of(&s)).format(&items);
    if items.is_empty() {
        return Ok(PartialState::new().set(DRAFT_RESPONSE, template()));
    }

    let documents: Vec<String> = items.iter().map(describe_item).collect();
    let prompt = format!(
        "당신은 광주광역시 플리마켓 안내 챗봇입니다. 아래 문서만 근거로 질문에 답하세요.\n\n질문: {}\n\n문서:\n{}",
        asked_query(&s),
        documents.join("\n")
    );
    let update = match ctx.collaborators.generator.generate(&prompt).await {
        Ok(text) if !text.trim().is_empty() => PartialState::new().set(DRAFT_RESPONSE, text.trim()),
        Ok(_) => PartialState::new()
            .set(DRAFT_RESPONSE, template())
            .set(INSIGHTS, json!({ "draft_error": "empty generation" })),
        Err(e) => {
            debug!(error = %e, "Draft generation unavailable, using template");
            PartialState::new()
                .set(DRAFT_RESPONSE, template())
                .set(INSIGHTS, json!({ "draft_error": e.to_string() }))
        }
    };
    Ok(update)
}

/// Check the draft against the documents it was written from
async fn grade_answer(ctx: Arc<WorkflowContext>, s: StateSnapshot) -> StepResult {
    let items = context_items(&s);
    if items.is_empty() {
        return Ok(PartialState::new().set(FAITHFULNESS, GROUNDED));
    }

    let documents: Vec<String> = items.iter().map(describe_item).collect();
    let prompt = format!(
        "문서:\n{}\n\n답변:\n{}\n\n답변이 문서 내용에만 근거하면 grounded, 문서에 없는 내용을 지어냈으면 hallucinated로 답하세요.",
        documents.join("\n"),
        s.str(DRAFT_RESPONSE)
    );
    let update = match ctx.collaborators.generator.classify(&prompt, &[GROUNDED, HALLUCINATED]).await {
        Ok(label) => {
            if label == HALLUCINATED {
                info!("Draft not grounded in the documents");
            }
            PartialState::new().set(FAITHFULNESS, label)
        }
        Err(e) => {
            warn!(error = %e, "Faithfulness grading failed, keeping draft");
            PartialState::new()
                .set(FAITHFULNESS, GROUNDED)
                .set(INSIGHTS, json!({ "grade_answer_error": e.to_string() }))
        }
    };
    Ok(update)
}

async fn validate(ctx: Arc<WorkflowContext>, s: StateSnapshot) -> StepResult {
    let verdict = validation::assess(
        asked_query(&s),
        s.str(DRAFT_RESPONSE),
        context_items(&s).len(),
        ctx.max_results,
        ctx.min_coverage,
    );
    debug!(status = verdict.status.as_str(), coverage = verdict.coverage, missing = ?verdict.missing_terms, "Draft validated");
    Ok(PartialState::new().set(VALIDATION, serde_json::to_value(&verdict)?))
}

/// One-shot correction: search again with the missing terms and re-draft
async fn correct(ctx: Arc<WorkflowContext>, s: StateSnapshot) -> StepResult {
    let role = role_of(&s);
    let missing = verdict(&s).map(|v| v.missing_terms).unwrap_or_default();
    let query = format!("{} {}", s.str(QUERY), missing.join(" ")).trim().to_string();
    let retriever = match role {
        Role::Consumer => &ctx.collaborators.markets,
        Role::Seller => &ctx.collaborators.seller_guide,
    };

    let mut update = PartialState::new();
    let found: Vec<Value> = match retriever.search(&query, ctx.max_results, None).await {
        Ok(records) => records.iter().map(|r| r.to_value()).collect(),
        Err(e) => {
            warn!(error = %e, "Corrective search failed");
            update.insert(INSIGHTS, json!({ "correct_error": e.to_string() }));
            Vec::new()
        }
    };
    update.insert(EVIDENCE, json!({ CORRECTION_KEY: found.clone() }));

    let previous = context_items(&s);
    let items = merge_items([&found, &previous].into_iter(), ctx.max_results);
    let mut text = formatter(role).format(&items);
    if items.is_empty() {
        text = format!("{text}\n\n{GUIDANCE_NOTE}");
    }

    let assessed = validation::assess(asked_query(&s), &text, items.len(), ctx.max_results, ctx.min_coverage);
    let corrected = ValidationVerdict {
        status: ValidationStatus::Corrected,
        ..assessed
    };
    info!(found = found.len(), coverage = corrected.coverage, "Draft corrected");
    Ok(update
        .set(CONTEXT_ITEMS, Value::Array(items))
        .set(DRAFT_RESPONSE, text)
        .set(VALIDATION, serde_json::to_value(&corrected)?))
}

async fn format_response(_ctx: Arc<WorkflowContext>, s: StateSnapshot) -> StepResult {
    let response = [s.str(SPECIAL_RESPONSE), s.str(DRAFT_RESPONSE)]
        .into_iter()
        .find(|text| !text.trim().is_empty())
        .unwrap_or(UNAVAILABLE_RESPONSE);
    Ok(PartialState::new().set(RESPONSE, response))
}

async fn unavailable(_ctx: Arc<WorkflowContext>, _s: StateSnapshot) -> StepResult {
    Ok(PartialState::new().set(RESPONSE, UNAVAILABLE_RESPONSE))
}

fn role_of(s: &StateSnapshot) -> Role {
    s.str(ROLE).parse().unwrap_or_default()
}

/// The user's own wording, before any rewrite
fn asked_query(s: &StateSnapshot) -> &str {
    match s.str(ORIGINAL_QUERY) {
        "" => s.str(QUERY),
        original => original,
    }
}

fn formatter(role: Role) -> &'static dyn Formatter {
    match role {
        Role::Consumer => &ConsumerFormatter,
        Role::Seller => &SellerFormatter,
    }
}

fn context_items(s: &StateSnapshot) -> Vec<Value> {
    s.get(CONTEXT_ITEMS)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn verdict(s: &StateSnapshot) -> Option<ValidationVerdict> {
    s.deserialize(VALIDATION).ok().flatten()
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}

/// Concatenate batches in order, dropping repeated ids, up to `limit` items
fn merge_items<'a, I>(batches: I, limit: usize) -> Vec<Value>
where
    I: Iterator<Item = &'a Vec<Value>>,
{
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for item in batches.flatten() {
        let key = match item.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => item.to_string(),
        };
        if items.len() >= limit {
            break;
        }
        if seen.insert(key) {
            items.push(item.clone());
        }
    }
    items
}

fn describe_item(item: &Value) -> String {
    let field = |key: &str| item.get(key).and_then(Value::as_str).unwrap_or("");
    let name = [field("name"), field("zone")].into_iter().find(|v| !v.is_empty()).unwrap_or("?");
    let kind = [field("category"), field("theme")].into_iter().find(|v| !v.is_empty()).unwrap_or("");
    format!("- {name} ({kind}): {}", field("description"))
}
