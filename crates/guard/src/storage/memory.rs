//! In-process storage engine with row-security emulation.
//!
//! Rows are JSON objects grouped by table. A table with row security enabled
//! behaves like one carrying the usual tenant policy:
//!
//! ```sql
//! USING      ("tenantId" = current_setting('app.current_tenant_id', true)
//!             OR coalesce(current_setting('app.current_tenant_id', true), '') = '')
//! WITH CHECK (same expression)
//! ```
//!
//! Transactions work on a private copy of every table, published on commit.
//! Concurrent transactions are last-writer-wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use crate::access::{compare_values, AggregateSpec, Filter, Operation, Query, QueryOutput};
use crate::tenant::TENANT_FIELD;

use super::{Database, RowSecurityStatus, Session, StorageError};

type Tables = HashMap<String, Vec<Value>>;

#[derive(Debug, Default)]
struct Store {
    tables: Tables,
    policies: HashMap<String, RowSecurityStatus>,
}

/// Shared in-process database. Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    store: Arc<Mutex<Store>>,
    tenant_variable: Arc<str>,
}

impl MemoryDatabase {
    /// Database whose policies read `app.current_tenant_id`.
    pub fn new() -> Self {
        Self::with_variable("app.current_tenant_id")
    }

    pub fn with_variable(tenant_variable: impl Into<Arc<str>>) -> Self {
        Self {
            store: Arc::default(),
            tenant_variable: tenant_variable.into(),
        }
    }

    /// Turn on the tenant policy for `table`.
    pub fn enable_row_security(&self, table: &str, forced: bool, policy_count: u32) {
        self.lock().policies.insert(
            table.to_owned(),
            RowSecurityStatus {
                enabled: true,
                forced,
                policy_count,
            },
        );
    }

    /// Insert rows directly, bypassing policies and transactions.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        self.lock()
            .tables
            .entry(table.to_owned())
            .or_default()
            .extend(rows);
    }

    /// Committed rows of `table`, in insertion order, bypassing policies.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    type Session = MemorySession;

    async fn acquire(&self) -> Result<MemorySession, StorageError> {
        Ok(MemorySession {
            db: self.clone(),
            settings: HashMap::new(),
            local: HashMap::new(),
            tx: None,
        })
    }
}

/// One connection to a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemorySession {
    db: MemoryDatabase,
    settings: HashMap<String, String>,
    local: HashMap<String, String>,
    /// Working copy while a transaction is open.
    tx: Option<Tables>,
}

impl MemorySession {
    fn setting(&self, name: &str) -> Option<&String> {
        self.local.get(name).or_else(|| self.settings.get(name))
    }

    /// Tenant the policy restricts `table` to, if any.
    fn restriction(&self, table: &str) -> Option<String> {
        let enabled = self
            .db
            .lock()
            .policies
            .get(table)
            .is_some_and(|p| p.enabled);
        if !enabled {
            return None;
        }
        self.setting(&self.db.tenant_variable)
            .filter(|v| !v.is_empty())
            .cloned()
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn set_config(&mut self, name: &str, value: &str, is_local: bool) -> Result<(), StorageError> {
        match (is_local, self.tx.is_some()) {
            (true, true) => {
                self.local.insert(name.to_owned(), value.to_owned());
            }
            // A local set outside a transaction ends immediately.
            (true, false) => {}
            (false, _) => {
                self.settings.insert(name.to_owned(), value.to_owned());
            }
        }
        Ok(())
    }

    async fn current_config(&mut self, name: &str) -> Result<Option<String>, StorageError> {
        Ok(self.setting(name).cloned())
    }

    async fn reset_config(&mut self, name: &str) -> Result<(), StorageError> {
        self.local.remove(name);
        self.settings.remove(name);
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), StorageError> {
        if self.tx.is_some() {
            return Err(StorageError::Transaction("transaction already in progress"));
        }
        self.tx = Some(self.db.lock().tables.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let tables = self
            .tx
            .take()
            .ok_or(StorageError::Transaction("no transaction in progress"))?;
        self.db.lock().tables = tables;
        self.local.clear();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        self.tx
            .take()
            .ok_or(StorageError::Transaction("no transaction in progress"))?;
        self.local.clear();
        Ok(())
    }

    async fn execute(&mut self, query: &Query) -> Result<QueryOutput, StorageError> {
        let tenant = self.restriction(&query.model);
        let table = TableOp {
            name: &query.model,
            tenant: tenant.as_deref(),
        };
        match self.tx.as_mut() {
            Some(tables) => table.run(tables.entry(query.model.clone()).or_default(), &query.operation),
            None => {
                let mut store = self.db.lock();
                let rows = store.tables.entry(query.model.clone()).or_default();
                // Autocommit: a failed statement leaves the table untouched.
                let mut working = rows.clone();
                let out = table.run(&mut working, &query.operation)?;
                *rows = working;
                Ok(out)
            }
        }
    }

    async fn row_security(&mut self, table: &str) -> Result<RowSecurityStatus, StorageError> {
        Ok(self
            .db
            .lock()
            .policies
            .get(table)
            .copied()
            .unwrap_or_default())
    }
}

/// One statement against one table under an optional tenant restriction.
struct TableOp<'a> {
    name: &'a str,
    tenant: Option<&'a str>,
}

impl TableOp<'_> {
    fn visible(&self, row: &Value) -> bool {
        match self.tenant {
            None => true,
            Some(t) => row.get(TENANT_FIELD).and_then(Value::as_str) == Some(t),
        }
    }

    fn check(&self, row: &Value) -> Result<(), StorageError> {
        if self.visible(row) {
            Ok(())
        } else {
            Err(StorageError::PolicyViolation(self.name.to_owned()))
        }
    }

    fn positions(&self, rows: &[Value], filter: &Filter) -> Vec<usize> {
        rows.iter()
            .enumerate()
            .filter(|(_, row)| self.visible(row) && filter.matches(row))
            .map(|(i, _)| i)
            .collect()
    }

    fn first(&self, rows: &[Value], filter: &Filter) -> Option<usize> {
        rows.iter()
            .position(|row| self.visible(row) && filter.matches(row))
    }

    fn run(&self, rows: &mut Vec<Value>, op: &Operation) -> Result<QueryOutput, StorageError> {
        match op {
            Operation::FindMany {
                filter,
                order_by,
                skip,
                take,
            } => {
                let mut found: Vec<Value> = self
                    .positions(rows, filter)
                    .into_iter()
                    .map(|i| rows[i].clone())
                    .collect();
                if let Some(key) = order_by {
                    found.sort_by(|a, b| {
                        compare_values(
                            a.get(key).unwrap_or(&Value::Null),
                            b.get(key).unwrap_or(&Value::Null),
                        )
                    });
                }
                let skip = skip.unwrap_or(0) as usize;
                let take = take.map_or(usize::MAX, |t| t as usize);
                Ok(QueryOutput::Records(found.into_iter().skip(skip).take(take).collect()))
            }
            Operation::FindFirst { filter } | Operation::FindUnique { key: filter } => Ok(
                QueryOutput::Record(self.first(rows, filter).map(|i| rows[i].clone())),
            ),
            Operation::Create { data } => self.insert(rows, data).map(|r| QueryOutput::Record(Some(r))),
            Operation::CreateMany { data } => {
                for item in data {
                    self.insert(rows, item)?;
                }
                Ok(QueryOutput::Count(data.len() as u64))
            }
            Operation::Update { filter, data } => match self.first(rows, filter) {
                Some(i) => self.update_at(rows, i, data).map(|r| QueryOutput::Record(Some(r))),
                None => Ok(QueryOutput::Record(None)),
            },
            Operation::UpdateMany { filter, data } => {
                let hits = self.positions(rows, filter);
                for &i in &hits {
                    self.update_at(rows, i, data)?;
                }
                Ok(QueryOutput::Count(hits.len() as u64))
            }
            Operation::Upsert {
                filter,
                create,
                update,
            } => {
                let row = match self.first(rows, filter) {
                    Some(i) => self.update_at(rows, i, update)?,
                    None => self.insert(rows, create)?,
                };
                Ok(QueryOutput::Record(Some(row)))
            }
            Operation::Delete { filter } => Ok(QueryOutput::Record(
                self.first(rows, filter).map(|i| rows.remove(i)),
            )),
            Operation::DeleteMany { filter } => {
                let hits = self.positions(rows, filter);
                for &i in hits.iter().rev() {
                    rows.remove(i);
                }
                Ok(QueryOutput::Count(hits.len() as u64))
            }
            Operation::Count { filter } => {
                Ok(QueryOutput::Count(self.positions(rows, filter).len() as u64))
            }
            Operation::Aggregate { filter, spec } => {
                let hits: Vec<&Value> = self
                    .positions(rows, filter)
                    .into_iter()
                    .map(|i| &rows[i])
                    .collect();
                Ok(QueryOutput::Aggregate(aggregate(&hits, spec)))
            }
        }
    }

    fn insert(&self, rows: &mut Vec<Value>, data: &Value) -> Result<Value, StorageError> {
        let mut row = as_object(data)?.clone();
        let id = row
            .entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()))
            .clone();
        if rows.iter().any(|r| r.get("id") == Some(&id)) {
            return Err(StorageError::UniqueViolation {
                table: self.name.to_owned(),
                field: "id".into(),
            });
        }
        let row = Value::Object(row);
        self.check(&row)?;
        rows.push(row.clone());
        Ok(row)
    }

    fn update_at(&self, rows: &mut [Value], index: usize, data: &Value) -> Result<Value, StorageError> {
        let changes = as_object(data)?;
        let mut row = rows[index].clone();
        if let Value::Object(map) = &mut row {
            for (k, v) in changes {
                map.insert(k.clone(), v.clone());
            }
        }
        self.check(&row)?;
        rows[index] = row.clone();
        Ok(row)
    }
}

fn as_object(data: &Value) -> Result<&Map<String, Value>, StorageError> {
    data.as_object()
        .ok_or_else(|| StorageError::Statement("write payload must be a JSON object".into()))
}

fn aggregate(rows: &[&Value], spec: &AggregateSpec) -> Value {
    let number = |x: f64| Number::from_f64(x).map_or(Value::Null, Value::Number);
    let numbers = |field: &str| -> Vec<f64> {
        rows.iter()
            .filter_map(|r| r.get(field).and_then(Value::as_f64))
            .collect()
    };
    let present = |field: &str| {
        rows.iter()
            .filter_map(|r| r.get(field))
            .filter(|v| !v.is_null())
            .collect::<Vec<&Value>>()
    };
    let per_field = |fields: &[String], f: &dyn Fn(&str) -> Value| -> Value {
        Value::Object(fields.iter().map(|name| (name.clone(), f(name))).collect())
    };

    let mut out = Map::new();
    if spec.count {
        out.insert("_count".into(), Value::from(rows.len() as u64));
    }
    if !spec.sum.is_empty() {
        out.insert(
            "_sum".into(),
            per_field(&spec.sum, &|f| {
                let xs = numbers(f);
                if xs.is_empty() {
                    Value::Null
                } else {
                    number(xs.iter().sum())
                }
            }),
        );
    }
    if !spec.avg.is_empty() {
        out.insert(
            "_avg".into(),
            per_field(&spec.avg, &|f| {
                let xs = numbers(f);
                if xs.is_empty() {
                    Value::Null
                } else {
                    number(xs.iter().sum::<f64>() / xs.len() as f64)
                }
            }),
        );
    }
    if !spec.min.is_empty() {
        out.insert(
            "_min".into(),
            per_field(&spec.min, &|f| {
                present(f)
                    .into_iter()
                    .min_by(|a, b| compare_values(a, b))
                    .cloned()
                    .unwrap_or(Value::Null)
            }),
        );
    }
    if !spec.max.is_empty() {
        out.insert(
            "_max".into(),
            per_field(&spec.max, &|f| {
                present(f)
                    .into_iter()
                    .max_by(|a, b| compare_values(a, b))
                    .cloned()
                    .unwrap_or(Value::Null)
            }),
        );
    }
    Value::Object(out)
}
