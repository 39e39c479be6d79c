//! Closed set of workflow steps
//!
//! Every node of the chatbot graph is one [`Step`]. The workflow builder
//! resolves each variant to its step function once, when the graph is built.

use crate::schema::*;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {
    Guardrail,
    Classify,
    SmallTalk,
    Plan,
    Dispatch,
    Collect,
    GradeRelevance,
    Rewrite,
    Draft,
    GradeAnswer,
    Validate,
    Correct,
    Format,
    Unavailable,
}

impl Step {
    pub const ALL: [Step; 14] = [
        Step::Guardrail,
        Step::Classify,
        Step::SmallTalk,
        Step::Plan,
        Step::Dispatch,
        Step::Collect,
        Step::GradeRelevance,
        Step::Rewrite,
        Step::Draft,
        Step::GradeAnswer,
        Step::Validate,
        Step::Correct,
        Step::Format,
        Step::Unavailable,
    ];

    /// Node name in the graph
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Guardrail => "guardrail",
            Step::Classify => "classify",
            Step::SmallTalk => "small_talk",
            Step::Plan => "plan",
            Step::Dispatch => "dispatch",
            Step::Collect => "collect",
            Step::GradeRelevance => "grade_relevance",
            Step::Rewrite => "rewrite",
            Step::Draft => "draft",
            Step::GradeAnswer => "grade_answer",
            Step::Validate => "validate",
            Step::Correct => "correct",
            Step::Format => "format",
            Step::Unavailable => "unavailable",
        }
    }

    /// State fields the step owns
    ///
    /// Dispatch writes are derived by the engine from its dispatcher.
    pub fn writes(self) -> &'static [&'static str] {
        match self {
            Step::Guardrail => &[GUARDRAIL_TRIGGERED, GUARDRAIL_REASON, SPECIAL_RESPONSE],
            Step::Classify => &[INTENT, INSIGHTS],
            Step::SmallTalk => &[SPECIAL_RESPONSE, INSIGHTS],
            Step::Plan => &[RETRIEVAL_TASKS, ORIGINAL_QUERY],
            Step::Dispatch => &[],
            Step::Collect => &[CONTEXT_ITEMS],
            Step::GradeRelevance => &[RELEVANCE, INSIGHTS],
            Step::Rewrite => &[QUERY, REWRITE_COUNT, INSIGHTS],
            Step::Draft => &[DRAFT_RESPONSE, INSIGHTS],
            Step::GradeAnswer => &[FAITHFULNESS, INSIGHTS],
            Step::Validate => &[VALIDATION],
            Step::Correct => &[CONTEXT_ITEMS, DRAFT_RESPONSE, VALIDATION, EVIDENCE, INSIGHTS],
            Step::Format => &[RESPONSE],
            Step::Unavailable => &[RESPONSE],
        }
    }

    pub fn from_name(name: &str) -> Option<Step> {
        Step::ALL.into_iter().find(|step| step.as_str() == name)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
