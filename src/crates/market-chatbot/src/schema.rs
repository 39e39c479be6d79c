//! State fields of the chatbot workflow
//!
//! | Field | Policy | Written by |
//! |---|---|---|
//! | `role`, `query` | overwrite | caller, `rewrite` |
//! | `original_query` | overwrite | `plan` |
//! | `guardrail_triggered`, `guardrail_reason` | overwrite | `guardrail` |
//! | `special_response` | overwrite | `guardrail`, `small_talk` |
//! | `intent` | overwrite | `classify` |
//! | `retrieval_tasks` | overwrite | `plan` |
//! | `completed_tasks` | union | dispatch branches |
//! | `evidence`, `insights` | key merge | dispatch branches, recovering steps |
//! | `context_items` | overwrite | `collect`, `correct` |
//! | `relevance` | overwrite | `grade_relevance` |
//! | `faithfulness` | overwrite | `grade_answer` |
//! | `rewrite_count` | overwrite | `rewrite` |
//! | `draft_response`, `validation` | overwrite | `draft`, `validate`, `correct` |
//! | `response` | overwrite | `format`, `unavailable` |

use flowgraph_core::{MergePolicy, StateSchema, COMPLETED_TASKS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const ROLE: &str = "role";
pub const QUERY: &str = "query";
pub const ORIGINAL_QUERY: &str = "original_query";
pub const GUARDRAIL_TRIGGERED: &str = "guardrail_triggered";
pub const GUARDRAIL_REASON: &str = "guardrail_reason";
pub const SPECIAL_RESPONSE: &str = "special_response";
pub const INTENT: &str = "intent";
pub const RETRIEVAL_TASKS: &str = "retrieval_tasks";
pub const EVIDENCE: &str = "evidence";
pub const INSIGHTS: &str = "insights";
pub const CONTEXT_ITEMS: &str = "context_items";
pub const RELEVANCE: &str = "relevance";
pub const FAITHFULNESS: &str = "faithfulness";
pub const REWRITE_COUNT: &str = "rewrite_count";
pub const DRAFT_RESPONSE: &str = "draft_response";
pub const VALIDATION: &str = "validation";
pub const RESPONSE: &str = "response";

/// Schema shared by every run of the workflow
pub fn market_schema() -> StateSchema {
    let overwrite = [
        ROLE,
        QUERY,
        ORIGINAL_QUERY,
        GUARDRAIL_TRIGGERED,
        GUARDRAIL_REASON,
        SPECIAL_RESPONSE,
        INTENT,
        RETRIEVAL_TASKS,
        CONTEXT_ITEMS,
        RELEVANCE,
        FAITHFULNESS,
        REWRITE_COUNT,
        DRAFT_RESPONSE,
        VALIDATION,
        RESPONSE,
    ];
    let mut schema = StateSchema::new();
    for field in overwrite {
        schema.add_field(field, MergePolicy::Overwrite);
    }
    schema
        .field(COMPLETED_TASKS, MergePolicy::Union)
        .field(EVIDENCE, MergePolicy::KeyMerge)
        .field(INSIGHTS, MergePolicy::KeyMerge)
}

/// Who is asking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Consumer,
    Seller,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Consumer, Role::Seller];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Consumer => "consumer",
            Role::Seller => "seller",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "consumer" => Ok(Role::Consumer),
            "seller" => Ok(Role::Seller),
            other => Err(format!("unknown role '{other}', expected consumer or seller")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_policies() {
        let schema = market_schema();
        assert_eq!(schema.policy(QUERY), Some(MergePolicy::Overwrite));
        assert_eq!(schema.policy(COMPLETED_TASKS), Some(MergePolicy::Union));
        assert_eq!(schema.policy(EVIDENCE), Some(MergePolicy::KeyMerge));
        assert_eq!(schema.policy(INSIGHTS), Some(MergePolicy::KeyMerge));
        assert_eq!(schema.policy(FAITHFULNESS), Some(MergePolicy::Overwrite));
        assert_eq!(schema.len(), 18);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Seller".parse::<Role>(), Ok(Role::Seller));
        assert!("buyer".parse::<Role>().is_err());
        assert_eq!(serde_json::to_value(Role::Consumer).unwrap(), serde_json::json!("consumer"));
    }
}
