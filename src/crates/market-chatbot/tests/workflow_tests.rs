//! End-to-end runs of the chatbot workflow with scripted collaborators

use async_trait::async_trait;
use flowgraph_core::{
    CancellationToken, CollaboratorError, Generator, PartialState, Record, Retriever, SearchFilter, COMPLETED_TASKS,
};
use market_chatbot::generator::HeuristicGenerator;
use market_chatbot::planner::{INTENT_MARKET, INTENT_SMALLTALK, MARKET_TERMS};
use market_chatbot::retrieval::SellerGuide;
use market_chatbot::schema::{EVIDENCE, QUERY, REWRITE_COUNT, ROLE};
use market_chatbot::workflow::{GUIDANCE_NOTE, UNAVAILABLE_RESPONSE};
use market_chatbot::{Chatbot, ChatbotError, Collaborators, Role, SeedDataset, Settings, ValidationStatus};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn seed() -> Arc<SeedDataset> {
    let path = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/data/seed.json"));
    Arc::new(SeedDataset::load(path).await.unwrap())
}

/// Retriever with a canned answer
struct Scripted(Result<Vec<Record>, CollaboratorError>);

impl Scripted {
    fn empty() -> Arc<dyn Retriever> {
        Arc::new(Self(Ok(Vec::new())))
    }

    fn records(records: Vec<Record>) -> Arc<dyn Retriever> {
        Arc::new(Self(Ok(records)))
    }

    fn failing(message: &str) -> Arc<dyn Retriever> {
        Arc::new(Self(Err(CollaboratorError::Request(message.to_string()))))
    }
}

#[async_trait]
impl Retriever for Scripted {
    async fn search(&self, _: &str, limit: usize, _: Option<&SearchFilter>) -> Result<Vec<Record>, CollaboratorError> {
        self.0.clone().map(|records| records.into_iter().take(limit).collect())
    }
}

/// Never answers before the test gives up on it
struct Stalled;

#[async_trait]
impl Retriever for Stalled {
    async fn search(&self, _: &str, _: usize, _: Option<&SearchFilter>) -> Result<Vec<Record>, CollaboratorError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Vec::new())
    }
}

/// Grades every result irrelevant and rewrites queries verbatim
struct NeverSatisfied;

#[async_trait]
impl Generator for NeverSatisfied {
    async fn generate(&self, _prompt: &str) -> Result<String, CollaboratorError> {
        Ok("야간 플리마켓".to_string())
    }

    async fn classify(&self, _input: &str, labels: &[&str]) -> Result<String, CollaboratorError> {
        let label = if labels.contains(&"irrelevant") { "irrelevant" } else { labels[0] };
        Ok(label.to_string())
    }
}

/// Writes a fixed answer and calls it hallucinated a set number of times
struct Drafting {
    answer: &'static str,
    hallucinations: AtomicUsize,
}

impl Drafting {
    fn new(answer: &'static str, hallucinations: usize) -> Arc<Self> {
        Arc::new(Self {
            answer,
            hallucinations: AtomicUsize::new(hallucinations),
        })
    }
}

#[async_trait]
impl Generator for Drafting {
    async fn generate(&self, prompt: &str) -> Result<String, CollaboratorError> {
        if prompt.contains("재작성") {
            return Ok("남구 플리마켓".to_string());
        }
        Ok(format!("  {}\n", self.answer))
    }

    async fn classify(&self, _input: &str, labels: &[&str]) -> Result<String, CollaboratorError> {
        if labels.contains(&"hallucinated") {
            let remaining = self.hallucinations.load(Ordering::SeqCst);
            if remaining > 0 {
                self.hallucinations.store(remaining - 1, Ordering::SeqCst);
                return Ok("hallucinated".to_string());
            }
        }
        Ok(labels[0].to_string())
    }
}

fn offline() -> Arc<dyn Generator> {
    Arc::new(HeuristicGenerator::new().with_vocabulary(INTENT_MARKET, MARKET_TERMS))
}

fn market(id: &str, name: &str) -> Record {
    Record::new(id)
        .with_field("name", name)
        .with_field("category", "야시장")
        .with_field("attributes", json!(["야간"]))
        .with_field("location", "광주광역시 남구")
        .with_field("rating", 4.5)
}

/// Empty market searches, seed-backed seller guidance, offline generator
fn collaborators(dataset: Arc<SeedDataset>) -> Collaborators {
    Collaborators {
        markets: Scripted::empty(),
        metadata: Scripted::empty(),
        seller_guide: Arc::new(SellerGuide::new(dataset)),
        web: None,
        generator: offline(),
    }
}

#[tokio::test]
async fn test_empty_retrieval_is_corrected_once() {
    let dataset = seed().await;
    let chatbot = Chatbot::new(Settings::default(), dataset.clone(), collaborators(dataset)).unwrap();

    let outcome = chatbot.ask(Role::Consumer, "야간 플리마켓 추천해줘").await.unwrap();

    let validation = outcome.validation.unwrap();
    assert_eq!(validation.status, ValidationStatus::Corrected);
    assert_eq!(validation.coverage, 0.0);
    assert!(outcome.response.contains(GUIDANCE_NOTE));
    assert_eq!(outcome.visited.iter().filter(|n| *n == "correct").count(), 1);
    assert!(!outcome.forced_fallback);
}

#[tokio::test]
async fn test_forbidden_keyword_short_circuits() {
    let dataset = seed().await;
    let chatbot = Chatbot::new(Settings::default(), dataset.clone(), collaborators(dataset)).unwrap();

    let outcome = chatbot.ask(Role::Consumer, "도박 가능한 마켓 알려줘").await.unwrap();

    assert!(outcome.guardrail_triggered);
    assert_eq!(outcome.response, "해당 내용은 안내해 드리기 어렵습니다.");
    assert!(outcome.completed_tasks.is_empty());
    assert_eq!(outcome.visited, vec!["guardrail", "format"]);
}

#[tokio::test]
async fn test_failed_branch_still_reaches_the_join() {
    let dataset = seed().await;
    let collaborators = Collaborators {
        markets: Scripted::failing("index offline"),
        metadata: Scripted::records(vec![market("mkt-001", "양림 달빛 야시장")]),
        ..collaborators(dataset.clone())
    };
    let chatbot = Chatbot::new(Settings::default(), dataset, collaborators).unwrap();

    let initial = PartialState::new().set(ROLE, "consumer").set(QUERY, "남구 플리마켓 추천해줘");
    let outcome = chatbot.graph().run_traced(initial, CancellationToken::new()).await.unwrap();
    let state = outcome.snapshot();

    let evidence = state.object(EVIDENCE).unwrap();
    assert_eq!(evidence["vector"], json!([]));
    assert_eq!(evidence["metadata"].as_array().unwrap().len(), 1);
    // reported in planning order, whichever branch finished first
    assert_eq!(state.string_list(COMPLETED_TASKS), vec!["vector", "metadata"]);
    assert!(state.object("insights").unwrap().contains_key("vector_error"));
    assert_eq!(outcome.visited().iter().filter(|n| **n == "collect").count(), 1);
    assert!(state.str("response").contains("양림 달빛 야시장"));
}

#[tokio::test]
async fn test_endless_rewrites_fall_back() {
    let dataset = seed().await;
    let settings = Settings {
        max_reentries: 2,
        ..Settings::default()
    };
    let collaborators = Collaborators {
        markets: Scripted::records(vec![market("mkt-404", "엉뚱한 마켓")]),
        generator: Arc::new(NeverSatisfied),
        ..collaborators(dataset.clone())
    };
    let chatbot = Chatbot::new(settings, dataset, collaborators).unwrap();

    let initial = PartialState::new().set(ROLE, "consumer").set(QUERY, "야간 플리마켓 추천해줘");
    let outcome = chatbot.graph().run_traced(initial, CancellationToken::new()).await.unwrap();

    let forced = outcome.forced_fallback.as_ref().unwrap();
    assert_eq!(forced.fallback, "unavailable");
    assert_eq!(outcome.visited().last().copied(), Some("unavailable"));
    assert_eq!(outcome.snapshot().str("response"), UNAVAILABLE_RESPONSE);
    assert_eq!(outcome.snapshot().u64(REWRITE_COUNT), 2);
    assert_eq!(outcome.reentries.get("rewrite"), Some(&2));
    assert_eq!((forced.from.as_str(), forced.target.as_str()), ("grade_relevance", "rewrite"));
}

fn two_markets() -> Arc<dyn Retriever> {
    Scripted::records(vec![
        market("mkt-001", "양림 달빛 야시장"),
        market("mkt-002", "사직 골목 마켓"),
    ])
}

#[tokio::test]
async fn test_grounded_draft_comes_from_the_generator() {
    let dataset = seed().await;
    let collaborators = Collaborators {
        markets: two_markets(),
        generator: Drafting::new("양림 달빛 야시장과 사직 골목 마켓을 추천해요.", 0),
        ..collaborators(dataset.clone())
    };
    let chatbot = Chatbot::new(Settings::default(), dataset, collaborators).unwrap();

    let outcome = chatbot.ask(Role::Consumer, "남구 플리마켓 추천해줘").await.unwrap();

    assert_eq!(outcome.response, "양림 달빛 야시장과 사직 골목 마켓을 추천해요.");
    assert_eq!(outcome.validation.unwrap().status, ValidationStatus::Pass);
    assert!(!outcome.insights.contains_key("draft_error"));
    assert!(!outcome.visited.contains(&"rewrite".to_string()));
}

#[tokio::test]
async fn test_hallucinated_draft_is_rewritten() {
    let dataset = seed().await;
    let collaborators = Collaborators {
        markets: two_markets(),
        generator: Drafting::new("양림 달빛 야시장을 추천해요.", 1),
        ..collaborators(dataset.clone())
    };
    let chatbot = Chatbot::new(Settings::default(), dataset, collaborators).unwrap();

    let initial = PartialState::new().set(ROLE, "consumer").set(QUERY, "남구 플리마켓 추천해줘");
    let outcome = chatbot.graph().run_traced(initial, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.snapshot().u64(REWRITE_COUNT), 1);
    assert!(outcome.visited().windows(2).any(|pair| pair == ["grade_answer", "rewrite"]));
    assert_eq!(outcome.snapshot().str("faithfulness"), "grounded");
    assert_eq!(outcome.snapshot().str("response"), "양림 달빛 야시장을 추천해요.");
    assert!(outcome.forced_fallback.is_none());
}

#[tokio::test]
async fn test_hallucinations_share_the_rewrite_bound() {
    let dataset = seed().await;
    let settings = Settings {
        max_reentries: 1,
        ..Settings::default()
    };
    let collaborators = Collaborators {
        markets: two_markets(),
        generator: Drafting::new("존재하지 않는 마켓을 추천해요.", 10),
        ..collaborators(dataset.clone())
    };
    let chatbot = Chatbot::new(settings, dataset, collaborators).unwrap();

    let initial = PartialState::new().set(ROLE, "consumer").set(QUERY, "남구 플리마켓 추천해줘");
    let outcome = chatbot.graph().run_traced(initial, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.snapshot().u64(REWRITE_COUNT), 1);
    let forced = outcome.forced_fallback.as_ref().unwrap();
    assert_eq!((forced.from.as_str(), forced.target.as_str()), ("grade_answer", "rewrite"));
    assert_eq!(outcome.snapshot().str("response"), UNAVAILABLE_RESPONSE);
}

#[tokio::test]
async fn test_small_talk_skips_retrieval() {
    let dataset = seed().await;
    let generator = HeuristicGenerator::new()
        .with_vocabulary(INTENT_MARKET, MARKET_TERMS)
        .with_vocabulary(INTENT_SMALLTALK, &["안녕", "고마워"]);
    let collaborators = Collaborators {
        generator: Arc::new(generator),
        ..collaborators(dataset.clone())
    };
    let chatbot = Chatbot::new(Settings::default(), dataset, collaborators).unwrap();

    let outcome = chatbot.ask(Role::Consumer, "안녕하세요").await.unwrap();

    assert_eq!(outcome.intent.as_deref(), Some(INTENT_SMALLTALK));
    assert!(outcome.completed_tasks.is_empty());
    assert!(outcome.response.starts_with("안녕하세요!"));
    assert!(outcome.insights.contains_key("small_talk_error"));
}

#[tokio::test]
async fn test_seller_gets_zone_guidance() {
    let dataset = seed().await;
    let chatbot = Chatbot::new(Settings::default(), dataset.clone(), collaborators(dataset)).unwrap();

    let outcome = chatbot.ask(Role::Seller, "남구에 부스 입점하고 싶어요").await.unwrap();

    assert!(outcome.completed_tasks.contains(&"seller_guide".to_string()));
    assert!(outcome.response.starts_with("입점 가능한 구역을 정리했어요."));
    assert!(outcome.response.contains("양림 골목"));
}

#[tokio::test]
async fn test_seeded_chatbot_answers_offline() {
    let dataset = seed().await;
    let chatbot = Chatbot::new(Settings::default(), dataset.clone(), Collaborators::seeded(dataset, offline())).unwrap();

    let outcome = chatbot.ask(Role::Consumer, "주말 빈티지 플리마켓 추천해줘").await.unwrap();

    assert!(!outcome.response.trim().is_empty());
    assert_eq!(outcome.intent.as_deref(), Some(INTENT_MARKET));
    assert!(outcome.completed_tasks.contains(&"vector".to_string()));
    // no web backend is configured
    assert!(outcome.completed_tasks.contains(&"web".to_string()));
    assert!(outcome.insights.contains_key("web_error"));
    // without a model the draft falls back to the consumer template
    assert!(outcome.insights.contains_key("draft_error"));
    assert!(outcome.response.starts_with("눈에 띄는 팝업들을 모아봤어요."));
    assert!(outcome.response.contains("충장로 빈티지 플리마켓"));
}

#[tokio::test]
async fn test_concurrent_asks_are_independent() {
    let dataset = seed().await;
    let chatbot = Arc::new(
        Chatbot::new(Settings::default(), dataset.clone(), Collaborators::seeded(dataset, offline())).unwrap(),
    );

    let consumer = chatbot.ask(Role::Consumer, "동구 빈티지 마켓 추천");
    let seller = chatbot.ask(Role::Seller, "동구 부스 입점 문의");
    let (consumer, seller) = tokio::join!(consumer, seller);

    let (consumer, seller) = (consumer.unwrap(), seller.unwrap());
    assert_ne!(consumer.run_id, seller.run_id);
    assert!(!consumer.completed_tasks.contains(&"seller_guide".to_string()));
    assert!(seller.completed_tasks.contains(&"seller_guide".to_string()));
}

#[tokio::test]
async fn test_cancelled_ask_returns_error() {
    let dataset = seed().await;
    let collaborators = Collaborators {
        markets: Arc::new(Stalled),
        ..collaborators(dataset.clone())
    };
    let chatbot = Chatbot::new(Settings::default(), dataset, collaborators).unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = chatbot
        .ask_with_cancel(Role::Consumer, "야간 플리마켓 추천해줘", token)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatbotError::Graph(_)));
}
