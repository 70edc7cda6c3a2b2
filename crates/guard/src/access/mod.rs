//! Data-access operation model and the interceptor pipeline.
//!
//! Every call against an entity type is a [`Query`]: the entity type name plus
//! one [`Operation`] shape carrying its filter, write payloads and paging
//! arguments. Interceptors never branch per shape; they work on the three
//! generic views an operation exposes:
//!
//! - [`Operation::filter_mut`]: the row predicate, if the shape has one that
//!   can embed extra conditions;
//! - [`Operation::payloads_mut`]: every write payload;
//! - [`QueryOutput::map_records`]: every record handed back to the caller.

pub mod client;
pub mod encryption;
pub mod scoping;
pub mod transform;

pub use client::ScopedClient;
pub use encryption::{EncryptionInterceptor, FieldOp, Selection};
pub use scoping::QueryScoping;

use std::cmp::Ordering;

use async_trait::async_trait;
use common::GuardError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::Session;
use crate::tenant::Scope;

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Row predicate: a JSON object whose entries are ANDed together.
///
/// Plain entries are equality conditions (`{"status": "active"}`). The keys
/// `AND`, `OR` and `NOT` take a nested filter or an array of nested filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(Map<String, Value>);

impl Filter {
    /// Matches every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Single equality condition.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(field, value)
    }

    /// Add an equality condition.
    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Set a condition, returning the one it replaced.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Condition on `field`, if any.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluate the filter against a record.
    ///
    /// A `null` condition matches both an explicit `null` and an absent field.
    pub fn matches(&self, record: &Value) -> bool {
        self.0.iter().all(|(key, cond)| match key.as_str() {
            "AND" => nested(cond).iter().all(|f| f.matches(record)),
            "OR" => nested(cond).iter().any(|f| f.matches(record)),
            "NOT" => !nested(cond).iter().any(|f| f.matches(record)),
            field => {
                let actual = record.get(field).unwrap_or(&Value::Null);
                actual == cond
            }
        })
    }
}

impl From<Map<String, Value>> for Filter {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Filter {
    type Error = GuardError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::all()),
            _ => Err(GuardError::Validation("filter must be a JSON object".into())),
        }
    }
}

/// Sub-filters of an `AND` / `OR` / `NOT` entry. Anything that is not an object
/// becomes a filter matching nothing.
pub(crate) fn nested(cond: &Value) -> Vec<Filter> {
    let never = || Filter::eq("OR", Value::Array(Vec::new()));
    let one = |v: &Value| match v {
        Value::Object(map) => Filter(map.clone()),
        _ => never(),
    };
    match cond {
        Value::Array(items) => items.iter().map(one).collect(),
        other => vec![one(other)],
    }
}

/// Total order used for `order_by`: null < bool < number < string < other.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Aggregations requested by [`Operation::Aggregate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Include `_count`.
    #[serde(default)]
    pub count: bool,
    #[serde(default)]
    pub sum: Vec<String>,
    #[serde(default)]
    pub avg: Vec<String>,
    #[serde(default)]
    pub min: Vec<String>,
    #[serde(default)]
    pub max: Vec<String>,
}

/// Coarse classification used by interceptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
    Aggregate,
}

/// One data-access call shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    FindMany {
        filter: Filter,
        order_by: Option<String>,
        skip: Option<u64>,
        take: Option<u64>,
    },
    FindFirst {
        filter: Filter,
    },
    /// Lookup by a unique key. The key cannot carry extra predicates.
    FindUnique {
        key: Filter,
    },
    Create {
        data: Value,
    },
    CreateMany {
        data: Vec<Value>,
    },
    Update {
        filter: Filter,
        data: Value,
    },
    UpdateMany {
        filter: Filter,
        data: Value,
    },
    Upsert {
        filter: Filter,
        create: Value,
        update: Value,
    },
    Delete {
        filter: Filter,
    },
    DeleteMany {
        filter: Filter,
    },
    Count {
        filter: Filter,
    },
    Aggregate {
        filter: Filter,
        spec: AggregateSpec,
    },
}

impl Operation {
    /// Conventional operation name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::FindMany { .. } => "findMany",
            Operation::FindFirst { .. } => "findFirst",
            Operation::FindUnique { .. } => "findUnique",
            Operation::Create { .. } => "create",
            Operation::CreateMany { .. } => "createMany",
            Operation::Update { .. } => "update",
            Operation::UpdateMany { .. } => "updateMany",
            Operation::Upsert { .. } => "upsert",
            Operation::Delete { .. } => "delete",
            Operation::DeleteMany { .. } => "deleteMany",
            Operation::Count { .. } => "count",
            Operation::Aggregate { .. } => "aggregate",
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::FindMany { .. } | Operation::FindFirst { .. } | Operation::FindUnique { .. } => {
                OperationKind::Read
            }
            Operation::Count { .. } | Operation::Aggregate { .. } => OperationKind::Aggregate,
            _ => OperationKind::Write,
        }
    }

    /// `true` for lookups whose key cannot embed a tenant predicate.
    pub fn is_unique_lookup(&self) -> bool {
        matches!(self, Operation::FindUnique { .. })
    }

    /// The predicate that can be narrowed with extra conditions.
    pub fn filter(&self) -> Option<&Filter> {
        match self {
            Operation::FindMany { filter, .. }
            | Operation::FindFirst { filter }
            | Operation::Update { filter, .. }
            | Operation::UpdateMany { filter, .. }
            | Operation::Upsert { filter, .. }
            | Operation::Delete { filter }
            | Operation::DeleteMany { filter }
            | Operation::Count { filter }
            | Operation::Aggregate { filter, .. } => Some(filter),
            Operation::FindUnique { .. } | Operation::Create { .. } | Operation::CreateMany { .. } => None,
        }
    }

    /// Mutable access to the predicate; see [`Operation::filter`].
    pub fn filter_mut(&mut self) -> Option<&mut Filter> {
        match self {
            Operation::FindMany { filter, .. }
            | Operation::FindFirst { filter }
            | Operation::Update { filter, .. }
            | Operation::UpdateMany { filter, .. }
            | Operation::Upsert { filter, .. }
            | Operation::Delete { filter }
            | Operation::DeleteMany { filter }
            | Operation::Count { filter }
            | Operation::Aggregate { filter, .. } => Some(filter),
            Operation::FindUnique { .. } | Operation::Create { .. } | Operation::CreateMany { .. } => None,
        }
    }

    /// Every write payload carried by the operation.
    pub fn payloads_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Operation::Create { data }
            | Operation::Update { data, .. }
            | Operation::UpdateMany { data, .. } => vec![data],
            Operation::CreateMany { data } => data.iter_mut().collect(),
            Operation::Upsert { create, update, .. } => vec![create, update],
            _ => Vec::new(),
        }
    }
}

/// A data-access call against one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Entity type name, e.g. `"Patient"`.
    pub model: String,
    pub operation: Operation,
}

impl Query {
    pub fn new(model: impl Into<String>, operation: Operation) -> Self {
        Self {
            model: model.into(),
            operation,
        }
    }

    pub fn find_many(model: impl Into<String>, filter: Filter) -> Self {
        Self::new(
            model,
            Operation::FindMany {
                filter,
                order_by: None,
                skip: None,
                take: None,
            },
        )
    }

    /// One page of rows ordered by `order_by`.
    pub fn page(model: impl Into<String>, filter: Filter, order_by: &str, skip: u64, take: u64) -> Self {
        Self::new(
            model,
            Operation::FindMany {
                filter,
                order_by: Some(order_by.to_owned()),
                skip: Some(skip),
                take: Some(take),
            },
        )
    }

    pub fn find_first(model: impl Into<String>, filter: Filter) -> Self {
        Self::new(model, Operation::FindFirst { filter })
    }

    pub fn find_unique(model: impl Into<String>, key: Filter) -> Self {
        Self::new(model, Operation::FindUnique { key })
    }

    pub fn create(model: impl Into<String>, data: Value) -> Self {
        Self::new(model, Operation::Create { data })
    }

    pub fn create_many(model: impl Into<String>, data: Vec<Value>) -> Self {
        Self::new(model, Operation::CreateMany { data })
    }

    pub fn update(model: impl Into<String>, filter: Filter, data: Value) -> Self {
        Self::new(model, Operation::Update { filter, data })
    }

    pub fn update_many(model: impl Into<String>, filter: Filter, data: Value) -> Self {
        Self::new(model, Operation::UpdateMany { filter, data })
    }

    pub fn upsert(model: impl Into<String>, filter: Filter, create: Value, update: Value) -> Self {
        Self::new(model, Operation::Upsert { filter, create, update })
    }

    pub fn delete(model: impl Into<String>, filter: Filter) -> Self {
        Self::new(model, Operation::Delete { filter })
    }

    pub fn delete_many(model: impl Into<String>, filter: Filter) -> Self {
        Self::new(model, Operation::DeleteMany { filter })
    }

    pub fn count(model: impl Into<String>, filter: Filter) -> Self {
        Self::new(model, Operation::Count { filter })
    }

    pub fn aggregate(model: impl Into<String>, filter: Filter, spec: AggregateSpec) -> Self {
        Self::new(model, Operation::Aggregate { filter, spec })
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// What a data-access call returns.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    /// Single-record shapes; `None` means "not found".
    Record(Option<Value>),
    Records(Vec<Value>),
    /// Affected or counted rows.
    Count(u64),
    /// Aggregate object (`_count`, `_sum`, ...).
    Aggregate(Value),
}

impl QueryOutput {
    /// Rebuild the output with `f` applied to every returned record.
    pub fn map_records(self, mut f: impl FnMut(Value) -> Value) -> Self {
        match self {
            QueryOutput::Record(record) => QueryOutput::Record(record.map(f)),
            QueryOutput::Records(records) => {
                QueryOutput::Records(records.into_iter().map(&mut f).collect())
            }
            other => other,
        }
    }

    pub fn into_record(self) -> Result<Option<Value>, GuardError> {
        match self {
            QueryOutput::Record(record) => Ok(record),
            other => Err(shape_error("record", &other)),
        }
    }

    pub fn into_records(self) -> Result<Vec<Value>, GuardError> {
        match self {
            QueryOutput::Records(records) => Ok(records),
            other => Err(shape_error("records", &other)),
        }
    }

    pub fn into_count(self) -> Result<u64, GuardError> {
        match self {
            QueryOutput::Count(n) => Ok(n),
            other => Err(shape_error("count", &other)),
        }
    }

    pub fn into_aggregate(self) -> Result<Value, GuardError> {
        match self {
            QueryOutput::Aggregate(v) => Ok(v),
            other => Err(shape_error("aggregate", &other)),
        }
    }
}

fn shape_error(expected: &str, got: &QueryOutput) -> GuardError {
    let got = match got {
        QueryOutput::Record(_) => "record",
        QueryOutput::Records(_) => "records",
        QueryOutput::Count(_) => "count",
        QueryOutput::Aggregate(_) => "aggregate",
    };
    GuardError::Internal(format!("expected {expected} output, storage returned {got}"))
}

// ---------------------------------------------------------------------------
// Interceptors
// ---------------------------------------------------------------------------

/// Per-call state handed to interceptors.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Scope of the unit of work.
    pub scope: Scope,
    /// Whether the call runs inside a transaction opened for this scope.
    pub in_transaction: bool,
}

/// A hook wrapped around every data-access call.
///
/// `before` hooks run in registration order and may rewrite the query or abort
/// the call; `after` hooks run in reverse order and cannot fail.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn before(
        &self,
        _session: &mut dyn Session,
        _ctx: &CallContext,
        _query: &mut Query,
    ) -> Result<(), GuardError> {
        Ok(())
    }

    fn after(&self, _ctx: &CallContext, _query: &Query, output: QueryOutput) -> QueryOutput {
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equality_filter_matches() {
        let row = json!({"id": "1", "status": "active", "n": 3});
        assert!(Filter::eq("status", "active").matches(&row));
        assert!(Filter::eq("status", "active").and("n", 3).matches(&row));
        assert!(!Filter::eq("status", "closed").matches(&row));
        assert!(Filter::all().matches(&row));
    }

    #[test]
    fn null_condition_matches_absent_field() {
        let row = json!({"id": "1"});
        assert!(Filter::eq("deletedAt", Value::Null).matches(&row));
    }

    #[test]
    fn combinators() {
        let row = json!({"a": 1, "b": 2});
        let or: Filter = json!({"OR": [{"a": 5}, {"b": 2}]}).try_into().unwrap();
        assert!(or.matches(&row));
        let and: Filter = json!({"AND": [{"a": 1}, {"b": 3}]}).try_into().unwrap();
        assert!(!and.matches(&row));
        let not: Filter = json!({"NOT": {"a": 1}}).try_into().unwrap();
        assert!(!not.matches(&row));
        let empty_or: Filter = json!({"OR": []}).try_into().unwrap();
        assert!(!empty_or.matches(&row));
    }

    #[test]
    fn non_object_filter_rejected() {
        assert!(Filter::try_from(json!([1, 2])).is_err());
        assert!(Filter::try_from(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn operation_views() {
        let mut op = Operation::Upsert {
            filter: Filter::eq("id", "1"),
            create: json!({"a": 1}),
            update: json!({"a": 2}),
        };
        assert_eq!(op.kind(), OperationKind::Write);
        assert!(op.filter().is_some());
        assert_eq!(op.payloads_mut().len(), 2);

        let mut unique = Operation::FindUnique { key: Filter::eq("id", "1") };
        assert!(unique.is_unique_lookup());
        assert!(unique.filter_mut().is_none());
        assert!(unique.payloads_mut().is_empty());
        assert_eq!(unique.kind(), OperationKind::Read);

        let mut many = Operation::CreateMany {
            data: vec![json!({}), json!({}), json!({})],
        };
        assert_eq!(many.payloads_mut().len(), 3);
        assert_eq!(Operation::Count { filter: Filter::all() }.kind(), OperationKind::Aggregate);
    }

    #[test]
    fn map_records_leaves_counts_alone() {
        let out = QueryOutput::Count(4).map_records(|_| json!("x"));
        assert_eq!(out, QueryOutput::Count(4));
        let out = QueryOutput::Records(vec![json!(1), json!(2)]).map_records(|_| json!("x"));
        assert_eq!(out, QueryOutput::Records(vec![json!("x"), json!("x")]));
    }

    #[test]
    fn output_shape_mismatch_is_internal_error() {
        let err = QueryOutput::Count(1).into_records().unwrap_err();
        assert_eq!(err.code(), "internal_error");
    }

    #[test]
    fn value_ordering() {
        assert_eq!(compare_values(&json!(1), &json!(2)), Ordering::Less);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&Value::Null, &json!("a")), Ordering::Less);
    }
}
