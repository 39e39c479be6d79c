//! Request guardrails
//!
//! Rules run in order and the first hit wins:
//!
//! 1. forbidden keyword from the seed list
//! 2. disallowed topic from the seed list
//! 3. out-of-area request (mentions 서울 but not 광주)
//!
//! Matching is a case-insensitive substring test.

use crate::dataset::GuardrailConfig;
use crate::error::{ChatbotError, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

const FORBIDDEN_RESPONSE: &str = "해당 내용은 안내해 드리기 어렵습니다.";
const TOPIC_RESPONSE: &str = "요청하신 주제는 지원하지 않습니다.";

/// Outcome of a guardrail check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GuardrailVerdict {
    Pass,
    Blocked {
        /// Diagnostic reason, kept in state
        reason: String,
        /// Fixed refusal shown to the user
        response: String,
    },
}

impl GuardrailVerdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

struct Rule {
    term: String,
    pattern: Regex,
}

impl Rule {
    fn new(term: &str) -> Result<Self> {
        let pattern = RegexBuilder::new(&regex::escape(term.trim()))
            .case_insensitive(true)
            .build()
            .map_err(|e| ChatbotError::Config(format!("invalid guardrail term {term:?}: {e}")))?;
        Ok(Self {
            term: term.trim().to_string(),
            pattern,
        })
    }
}

pub struct Guardrails {
    forbidden: Vec<Rule>,
    topics: Vec<Rule>,
    service_area: String,
}

impl Guardrails {
    pub fn new(config: &GuardrailConfig) -> Result<Self> {
        let compile = |terms: &[String]| {
            terms
                .iter()
                .filter(|t| !t.trim().is_empty())
                .map(|t| Rule::new(t))
                .collect::<Result<Vec<_>>>()
        };
        Ok(Self {
            forbidden: compile(&config.forbidden_keywords)?,
            topics: compile(&config.disallowed_topics)?,
            service_area: config.service_area.clone(),
        })
    }

    pub fn check(&self, query: &str) -> GuardrailVerdict {
        if let Some(rule) = self.forbidden.iter().find(|r| r.pattern.is_match(query)) {
            return GuardrailVerdict::Blocked {
                reason: format!("금지 키워드 발견: {}", rule.term),
                response: FORBIDDEN_RESPONSE.to_string(),
            };
        }
        if let Some(rule) = self.topics.iter().find(|r| r.pattern.is_match(query)) {
            return GuardrailVerdict::Blocked {
                reason: format!("금지 토픽: {}", rule.term),
                response: TOPIC_RESPONSE.to_string(),
            };
        }
        if query.contains("서울") && !query.contains("광주") {
            return GuardrailVerdict::Blocked {
                reason: "서비스 지역 외 요청".to_string(),
                response: format!("현재 서비스는 {}만 지원합니다.", self.service_area),
            };
        }
        GuardrailVerdict::Pass
    }
}
