//! Error types and error handling for graph operations
//!
//! This module defines every error that can surface from building or running a
//! graph. All errors implement `std::error::Error` via the `thiserror` crate.
//!
//! # Error Hierarchy
//!
//! ```text
//! GraphError
//! ├── Validation      - Malformed graph, raised by compile() before any run
//! ├── Routing         - A router returned a label its edge never declared
//! ├── NodeExecution   - A step function returned an error
//! ├── State           - Ownership or merge violations while applying updates
//! ├── Join            - A barrier can never fire (branch finished without reporting)
//! ├── Cancelled       - The run's cancellation token fired
//! ├── Timeout         - The run exceeded its configured deadline
//! └── Serialization   - JSON conversion of typed views
//! ```
//!
//! Only `Validation` and `Routing` represent construction defects. Collaborator
//! failures never appear here: steps recover them locally and record the failure
//! in diagnostic state, and cycle exhaustion is routed to a fallback node rather
//! than reported.
//!
//! # Matching Specific Errors
//!
//! ```rust
//! use flowgraph_core::error::{GraphError, ValidationError};
//!
//! fn describe(err: &GraphError) -> String {
//!     match err {
//!         GraphError::Validation(ValidationError::DanglingEdge { from, to }) => {
//!             format!("edge {from} -> {to} points nowhere")
//!         }
//!         GraphError::Routing { node, label, .. } => {
//!             format!("router on {node} produced unknown label {label}")
//!         }
//!         other => other.to_string(),
//!     }
//! }
//! ```

use crate::state::StateError;
use thiserror::Error;

/// Result type alias for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Boxed error returned by step functions
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for graph construction and execution
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure validation failed
    ///
    /// Raised only by [`StateGraph::compile`](crate::StateGraph::compile); a
    /// compiled graph never produces it.
    ///
    /// **Recovery**: Fix graph construction, there is nothing to retry.
    #[error("Graph validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A conditional edge router returned a label missing from its mapping
    ///
    /// Fatal for the run. Surfaces to callers as an internal error.
    #[error("Router on '{node}' returned undeclared label '{label}' (expected one of {expected:?})")]
    Routing {
        /// Node whose outgoing conditional edge was evaluated
        node: String,
        /// Label the router produced
        label: String,
        /// Labels declared for that edge
        expected: Vec<String>,
    },

    /// Node execution failed with context
    ///
    /// # Example
    ///
    /// ```rust
    /// use flowgraph_core::error::GraphError;
    ///
    /// let err = GraphError::node_execution("plan", "planner exploded");
    /// assert_eq!(format!("{}", err), "Node 'plan' execution failed: planner exploded");
    /// ```
    #[error("Node '{node}' execution failed: {error}")]
    NodeExecution {
        /// Name of the node that failed
        node: String,
        /// Error message from node execution
        error: String,
    },

    /// State update rejected while the run was in progress
    ///
    /// **Common causes**:
    /// - A step wrote a field it did not declare in `writes`
    /// - Two concurrent branches wrote the same key of a key-merged field
    /// - A value had the wrong JSON shape for its merge policy
    #[error("State error in node '{node}': {error}")]
    State {
        /// Node whose update was rejected
        node: String,
        /// Underlying state error
        error: StateError,
    },

    /// A join barrier can never fire
    ///
    /// Every branch of the fan-out returned but the completion field still lacks
    /// some expected identifiers. Reported instead of waiting forever.
    #[error("Join '{node}' cannot fire, missing completions: {missing:?}")]
    Join {
        /// Join node name
        node: String,
        /// Expected identifiers absent from the completion field
        missing: Vec<String>,
    },

    /// The run was cancelled through its cancellation token
    #[error("Run cancelled")]
    Cancelled,

    /// Operation exceeded time limit
    #[error("Run timed out after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    /// Create a node execution error with context
    pub fn node_execution(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            error: error.into(),
        }
    }

    /// Create a state error attributed to a node
    pub fn state(node: impl Into<String>, error: StateError) -> Self {
        Self::State {
            node: node.into(),
            error,
        }
    }

    /// Whether this error is a construction defect (build or routing)
    ///
    /// These are the only errors a service boundary should report as internal
    /// failures; everything else either cannot happen for a valid graph or is
    /// a caller-initiated stop.
    pub fn is_construction_defect(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Routing { .. })
    }
}

/// Build-time graph defects
///
/// Every variant names the offending node, edge or field so the defect can be
/// located without running the graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("node '{0}' is declared more than once")]
    DuplicateNode(String),

    #[error("node name '{0}' is reserved")]
    ReservedName(String),

    #[error("node '{node}' writes field '{field}' which is not in the state schema")]
    UnknownField { node: String, field: String },

    #[error("graph has no entry edge from __start__")]
    MissingEntry,

    #[error("graph has {0} entry edges from __start__, expected exactly one")]
    MultipleEntries(usize),

    #[error("edge {from} -> __start__ targets the entry marker")]
    EdgeIntoStart { from: String },

    #[error("edge source '{0}' is not a declared node")]
    UnknownSource(String),

    #[error("edge {from} -> {to} targets an undeclared node")]
    DanglingEdge { from: String, to: String },

    #[error("conditional edge on '{from}' maps label '{label}' to undeclared node '{to}'")]
    DanglingLabel {
        from: String,
        label: String,
        to: String,
    },

    #[error("conditional edge on '{0}' declares no labels")]
    EmptyLabelMap(String),

    #[error("node '{0}' mixes static and conditional outgoing edges")]
    MixedEdges(String),

    #[error("node '{0}' has more than one conditional edge")]
    MultipleConditionalEdges(String),

    #[error("node '{0}' has no outgoing edge")]
    DeadEnd(String),

    #[error("fan-out branch '{branch}' from '{from}' does not reach a join node through static edges")]
    BranchWithoutJoin { from: String, branch: String },

    #[error("fan-out from '{from}' converges on different joins: {joins:?}")]
    DivergentJoins { from: String, joins: Vec<String> },

    #[error("concurrent branches '{first}' and '{second}' both write overwrite field '{field}'")]
    ConflictingBranchWrites {
        first: String,
        second: String,
        field: String,
    },

    #[error("dispatch node '{node}' must have exactly one static edge to a join node")]
    DispatchWithoutJoin { node: String },

    #[error("completion field '{0}' must be declared with the union policy")]
    MissingCompletionField(String),

    #[error("dispatch node '{node}' uses field '{field}' with the wrong merge policy")]
    DispatchFieldPolicy { node: String, field: String },

    #[error("__end__ is not reachable from __start__")]
    UnreachableEnd,

    #[error("cycle through '{0}' has no conditional edge and can never exit")]
    StaticCycle(String),

    #[error("graph contains a cycle through '{0}' but no cycle fallback is set")]
    MissingFallback(String),

    #[error("cycle fallback '{0}' is not a declared node")]
    UnknownFallback(String),

    #[error("cycle fallback '{node}' does not terminate through static edges (stopped at '{at}')")]
    FallbackNotTerminal { node: String, at: String },
}

/// Failures surfaced by external collaborators (retrieval, generation)
///
/// Steps never propagate these; they substitute an empty result and record the
/// message in diagnostic state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("malformed response: {0}")]
    Response(String),

    #[error("label '{label}' is not one of {allowed:?}")]
    UnexpectedLabel { label: String, allowed: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_execution_display() {
        let err = GraphError::node_execution("draft", "boom");
        assert_eq!(err.to_string(), "Node 'draft' execution failed: boom");
    }

    #[test]
    fn test_validation_names_offending_edge() {
        let err: GraphError = ValidationError::DanglingEdge {
            from: "plan".into(),
            to: "ghost".into(),
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("plan -> ghost"));
        assert!(err.is_construction_defect());
    }

    #[test]
    fn test_routing_is_construction_defect() {
        let err = GraphError::Routing {
            node: "validate".into(),
            label: "maybe".into(),
            expected: vec!["pass".into(), "fail".into()],
        };
        assert!(err.is_construction_defect());
        assert!(!GraphError::Cancelled.is_construction_defect());
    }

    #[test]
    fn test_state_error_context() {
        let err = GraphError::state("plan", StateError::UndeclaredWrite("response".into()));
        assert_eq!(
            err.to_string(),
            "State error in node 'plan': field 'response' was written without being declared by the step"
        );
    }
}
