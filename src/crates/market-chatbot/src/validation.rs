//! Draft validation
//!
//! A draft passes when enough items back it and it mentions every facet the
//! user asked for:
//!
//! - coverage = min(items / max_results, 1)
//! - required terms = facet lexicon terms present in the query
//! - missing terms = required terms absent from the draft
//!
//! `pass` iff coverage >= the threshold and nothing is missing.

use serde::{Deserialize, Serialize};

/// Facets users commonly ask for
pub const FACET_TERMS: &[&str] = &[
    "야간", "주말", "평일", "빈티지", "핸드메이드", "공예", "예술", "푸드", "반려동물", "가족", "키즈", "실내", "야외",
    "친환경", "주차", "공연", "로컬",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pass,
    Fail,
    /// Failed once and went through the corrective retry
    Corrected,
}

impl ValidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationStatus::Pass => "pass",
            ValidationStatus::Fail => "fail",
            ValidationStatus::Corrected => "corrected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub status: ValidationStatus,
    pub coverage: f64,
    #[serde(default)]
    pub missing_terms: Vec<String>,
}

impl ValidationVerdict {
    pub fn passed(&self) -> bool {
        self.status == ValidationStatus::Pass
    }
}

/// Facet terms the query asks for, in lexicon order
pub fn required_terms(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    FACET_TERMS
        .iter()
        .filter(|term| lowered.contains(**term))
        .map(|term| term.to_string())
        .collect()
}

pub fn coverage(items: usize, max_results: usize) -> f64 {
    if max_results == 0 {
        return if items > 0 { 1.0 } else { 0.0 };
    }
    (items as f64 / max_results as f64).min(1.0)
}

/// Grade a draft against the query it answers
pub fn assess(query: &str, draft: &str, items: usize, max_results: usize, min_coverage: f64) -> ValidationVerdict {
    let coverage = coverage(items, max_results);
    let draft = draft.to_lowercase();
    let missing_terms: Vec<String> = required_terms(query)
        .into_iter()
        .filter(|term| !draft.contains(term.as_str()))
        .collect();
    let status = if coverage >= min_coverage && missing_terms.is_empty() {
        ValidationStatus::Pass
    } else {
        ValidationStatus::Fail
    };
    ValidationVerdict {
        status,
        coverage,
        missing_terms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pass() {
        let verdict = assess("야간 마켓", "야간 푸드 마켓입니다", 3, 5, 0.4);
        assert!(verdict.passed());
        assert_eq!(verdict.coverage, 0.6);
    }

    #[test]
    fn test_zero_items_fail() {
        let verdict = assess("야간 플리마켓 추천해줘", "찾지 못했어요", 0, 5, 0.4);
        assert_eq!(verdict.status, ValidationStatus::Fail);
        assert_eq!(verdict.coverage, 0.0);
        assert_eq!(verdict.missing_terms, vec!["야간"]);
    }

    #[test]
    fn test_missing_term_fails_with_full_coverage() {
        let verdict = assess("주차 되는 빈티지 마켓", "빈티지 마켓 다섯 곳", 5, 5, 0.4);
        assert_eq!(verdict.status, ValidationStatus::Fail);
        assert_eq!(verdict.missing_terms, vec!["주차"]);
    }

    #[test]
    fn test_serialized_shape() {
        let verdict = assess("", "", 1, 2, 0.4);
        let value = serde_json::to_value(&verdict).unwrap();
        assert_eq!(value, serde_json::json!({"status": "pass", "coverage": 0.5, "missing_terms": []}));
    }

    proptest! {
        #[test]
        fn prop_coverage_is_clamped(items in 0usize..100, max in 0usize..20) {
            let c = coverage(items, max);
            prop_assert!((0.0..=1.0).contains(&c));
        }
    }
}
