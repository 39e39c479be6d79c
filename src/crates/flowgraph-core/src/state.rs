//! State container, schema and merge policies
//!
//! The state threaded through a graph run is a JSON object whose fields are
//! fixed up front by a [`StateSchema`]. Every field carries a [`MergePolicy`]
//! that decides how a step's partial update combines with the running value.
//!
//! # Merge Policies
//!
//! | Policy | Behavior | Use Case |
//! |--------|----------|----------|
//! | [`MergePolicy::Overwrite`] | Last write wins | query, draft, verdicts, counters |
//! | [`MergePolicy::Union`] | Append array items, dropping duplicates | completed task names |
//! | [`MergePolicy::KeyMerge`] | Shallow object key insert/replace | per-task evidence, diagnostics |
//!
//! `Union` and `KeyMerge` are commutative for disjoint keys, which is what lets
//! concurrent branches write into the same field without coordination.
//!
//! # Examples
//!
//! ```rust
//! use flowgraph_core::state::{MergePolicy, PartialState, State, StateSchema};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let schema = Arc::new(
//!     StateSchema::new()
//!         .field("query", MergePolicy::Overwrite)
//!         .field("completed_tasks", MergePolicy::Union)
//!         .field("evidence", MergePolicy::KeyMerge),
//! );
//!
//! let mut state = State::new(schema);
//! state.apply(&PartialState::new().set("query", "야간 마켓")).unwrap();
//! state
//!     .apply(&PartialState::new()
//!         .set("completed_tasks", json!(["vector"]))
//!         .set("evidence", json!({"vector": []})))
//!     .unwrap();
//! state
//!     .apply(&PartialState::new().set("completed_tasks", json!(["vector", "metadata"])))
//!     .unwrap();
//!
//! let snapshot = state.snapshot();
//! assert_eq!(snapshot.string_list("completed_tasks"), vec!["vector", "metadata"]);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors from merging a partial update into the running state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Referenced field does not exist in the schema
    #[error("field '{0}' is not declared in the state schema")]
    UnknownField(String),

    /// Update value has the wrong JSON shape for the field's policy
    #[error("field '{field}' expects {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A step wrote a field outside its declared write set
    #[error("field '{0}' was written without being declared by the step")]
    UndeclaredWrite(String),

    /// Two concurrent branches wrote the same key of a key-merged field
    #[error("key '{key}' of field '{field}' was written by two concurrent branches")]
    KeyCollision { field: String, key: String },
}

/// How a field combines an update with its current value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Replace the current value
    Overwrite,
    /// Array union preserving first-seen order
    Union,
    /// Shallow merge of object keys
    KeyMerge,
}

impl MergePolicy {
    /// Whether concurrent branches may write this field
    ///
    /// Overwrite fields written by two branches would make the result depend
    /// on completion order, so graph validation rejects that.
    pub fn is_concurrent_safe(&self) -> bool {
        !matches!(self, MergePolicy::Overwrite)
    }
}

/// Fixed set of state fields and their merge policies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSchema {
    fields: BTreeMap<String, MergePolicy>,
}

impl StateSchema {
    /// Create an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field declaration
    pub fn field(mut self, name: impl Into<String>, policy: MergePolicy) -> Self {
        self.add_field(name, policy);
        self
    }

    /// Declare a field (re-declaring replaces the policy)
    pub fn add_field(&mut self, name: impl Into<String>, policy: MergePolicy) {
        self.fields.insert(name.into(), policy);
    }

    /// Policy for a field, if declared
    pub fn policy(&self, name: &str) -> Option<MergePolicy> {
        self.fields.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Iterate declared fields in name order
    pub fn fields(&self) -> impl Iterator<Item = (&str, MergePolicy)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Merge `update` into `current` following the field's policy
    pub fn merge(&self, field: &str, current: Option<&Value>, update: &Value) -> Result<Value, StateError> {
        let policy = self
            .policy(field)
            .ok_or_else(|| StateError::UnknownField(field.to_string()))?;
        merge_value(policy, field, current, update)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Apply a single merge policy
///
/// A missing current value behaves like the policy's empty value. A current
/// value of the wrong shape is replaced rather than reported, since only the
/// update comes from a step.
pub fn merge_value(
    policy: MergePolicy,
    field: &str,
    current: Option<&Value>,
    update: &Value,
) -> Result<Value, StateError> {
    match policy {
        MergePolicy::Overwrite => Ok(update.clone()),
        MergePolicy::Union => {
            let incoming = update.as_array().ok_or_else(|| StateError::TypeMismatch {
                field: field.to_string(),
                expected: "array",
                found: json_kind(update),
            })?;
            let mut merged: Vec<Value> = current
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for item in incoming {
                if !merged.contains(item) {
                    merged.push(item.clone());
                }
            }
            Ok(Value::Array(merged))
        }
        MergePolicy::KeyMerge => {
            let incoming = update.as_object().ok_or_else(|| StateError::TypeMismatch {
                field: field.to_string(),
                expected: "object",
                found: json_kind(update),
            })?;
            let mut merged: Map<String, Value> = current
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            for (key, value) in incoming {
                merged.insert(key.clone(), value.clone());
            }
            Ok(Value::Object(merged))
        }
    }
}

/// Partial update produced by a step
///
/// Field order is preserved so traces list writes in the order a step made them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartialState {
    values: Map<String, Value>,
}

impl PartialState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field write
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Names of the fields this update writes
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Fold another update into this one using the schema's policies
    ///
    /// Used by fan-out branches to accumulate several step outputs into a single
    /// update that is applied at the join.
    pub fn absorb(&mut self, schema: &StateSchema, other: &PartialState) -> Result<(), StateError> {
        for (field, value) in &other.values {
            let merged = schema.merge(field, self.values.get(field), value)?;
            self.values.insert(field.clone(), merged);
        }
        Ok(())
    }
}

impl From<Map<String, Value>> for PartialState {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}

impl FromIterator<(String, Value)> for PartialState {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// The running state of one graph execution
///
/// Owned exclusively by a single run. Routing functions and steps only ever see
/// [`StateSnapshot`]s, never the mutable container.
#[derive(Debug, Clone)]
pub struct State {
    schema: Arc<StateSchema>,
    values: Map<String, Value>,
}

impl State {
    /// Empty state over a schema
    pub fn new(schema: Arc<StateSchema>) -> Self {
        Self {
            schema,
            values: Map::new(),
        }
    }

    /// State seeded with initial fields, merged like any other update
    pub fn from_fields(schema: Arc<StateSchema>, initial: &PartialState) -> Result<Self, StateError> {
        let mut state = Self::new(schema);
        state.apply(initial)?;
        Ok(state)
    }

    /// Branch-local working copy of a snapshot
    pub fn from_snapshot(schema: Arc<StateSchema>, snapshot: &StateSnapshot) -> Self {
        Self {
            schema,
            values: (*snapshot.values).clone(),
        }
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    pub fn schema_arc(&self) -> Arc<StateSchema> {
        Arc::clone(&self.schema)
    }

    /// Merge a partial update using each field's declared policy
    ///
    /// All fields are checked before anything is written, so a rejected update
    /// leaves the state untouched.
    pub fn apply(&mut self, update: &PartialState) -> Result<(), StateError> {
        let mut staged = Vec::with_capacity(update.len());
        for (field, value) in update.iter() {
            let merged = self.schema.merge(field, self.values.get(field), value)?;
            staged.push((field.clone(), merged));
        }
        for (field, value) in staged {
            self.values.insert(field, value);
        }
        Ok(())
    }

    /// Immutable copy for steps and routers
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            values: Arc::new(self.values.clone()),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Whole state as a JSON object
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    pub fn into_values(self) -> Map<String, Value> {
        self.values
    }
}

/// Read-only view of the state at a point in the run
///
/// Readers are lenient: a missing field reads as its empty value so step code
/// does not need to special-case fields that have not been written yet.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    values: Arc<Map<String, Value>>,
}

impl StateSnapshot {
    /// Snapshot from raw values (tests and routers built outside a run)
    pub fn from_value(value: Value) -> Self {
        let values = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            values: Arc::new(values),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// String field, `""` when missing or not a string
    pub fn str(&self, field: &str) -> &str {
        self.values.get(field).and_then(Value::as_str).unwrap_or("")
    }

    /// Boolean field, `false` when missing
    pub fn bool(&self, field: &str) -> bool {
        self.values.get(field).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Integer field, `0` when missing
    pub fn u64(&self, field: &str) -> u64 {
        self.values.get(field).and_then(Value::as_u64).unwrap_or(0)
    }

    /// String items of an array field, skipping non-strings
    pub fn string_list(&self, field: &str) -> Vec<String> {
        self.values
            .get(field)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn object(&self, field: &str) -> Option<&Map<String, Value>> {
        self.values.get(field).and_then(Value::as_object)
    }

    /// Deserialize a field into a typed view
    pub fn deserialize<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>, serde_json::Error> {
        match self.values.get(field) {
            Some(Value::Null) | None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object((*self.values).clone())
    }
}
