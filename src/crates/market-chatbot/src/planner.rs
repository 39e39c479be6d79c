//! Query analysis: intent heuristics and retrieval planning
//!
//! The planner decides which retrieval tasks a query needs:
//!
//! | Task | When |
//! |---|---|
//! | `vector` | always |
//! | `metadata` | the query names a region from the seed dataset |
//! | `web` | the query asks about something current (오늘, 이번 주, ...) |
//! | `seller_guide` | the asker is a seller |

use crate::dataset::SeedDataset;
use crate::schema::Role;

pub const TASK_VECTOR: &str = "vector";
pub const TASK_METADATA: &str = "metadata";
pub const TASK_WEB: &str = "web";
pub const TASK_SELLER_GUIDE: &str = "seller_guide";

pub const INTENT_MARKET: &str = "market";
pub const INTENT_SMALLTALK: &str = "smalltalk";

/// Terms that make a query time-sensitive
pub const FRESHNESS_TERMS: &[&str] = &["오늘", "이번 주", "이번주", "주말", "최신", "지금", "요즘"];

/// Vocabulary that marks a query as a market request
pub const MARKET_TERMS: &[&str] = &[
    "마켓", "시장", "장터", "플리", "팝업", "셀러", "입점", "부스", "추천", "어디", "market", "popup",
];

/// Keyword fallback for intent classification
pub fn heuristic_intent(query: &str) -> &'static str {
    if mentions_any(query, MARKET_TERMS) {
        INTENT_MARKET
    } else {
        INTENT_SMALLTALK
    }
}

/// Ordered retrieval tasks for a query
pub fn plan_tasks(query: &str, role: Role, dataset: &SeedDataset) -> Vec<String> {
    let mut tasks = vec![TASK_VECTOR.to_string()];
    if !dataset.regions_in(query).is_empty() {
        tasks.push(TASK_METADATA.to_string());
    }
    if mentions_any(query, FRESHNESS_TERMS) {
        tasks.push(TASK_WEB.to_string());
    }
    if role == Role::Seller {
        tasks.push(TASK_SELLER_GUIDE.to_string());
    }
    tasks
}

pub(crate) fn mentions_any(query: &str, terms: &[&str]) -> bool {
    let lowered = query.to_lowercase();
    terms.iter().any(|term| lowered.contains(term))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Region;

    fn dataset() -> SeedDataset {
        SeedDataset {
            regions: vec![Region {
                region_id: "region-nam".into(),
                name: "남구".into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_vector_always_planned() {
        assert_eq!(plan_tasks("빈티지 마켓", Role::Consumer, &dataset()), vec!["vector"]);
    }

    #[test]
    fn test_region_and_freshness() {
        let tasks = plan_tasks("이번 주 남구 야시장", Role::Consumer, &dataset());
        assert_eq!(tasks, vec!["vector", "metadata", "web"]);
    }

    #[test]
    fn test_seller_gets_guide() {
        let tasks = plan_tasks("입점 신청하고 싶어요", Role::Seller, &dataset());
        assert_eq!(tasks, vec!["vector", "seller_guide"]);
    }

    #[test]
    fn test_heuristic_intent() {
        assert_eq!(heuristic_intent("야간 플리마켓 추천해줘"), INTENT_MARKET);
        assert_eq!(heuristic_intent("Popup store?"), INTENT_MARKET);
        assert_eq!(heuristic_intent("안녕하세요"), INTENT_SMALLTALK);
    }
}
