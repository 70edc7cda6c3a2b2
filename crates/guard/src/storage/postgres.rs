//! PostgreSQL engine.
//!
//! Rows cross the boundary as `jsonb`: reads select `to_jsonb(t)`, writes go
//! through `jsonb_populate_record`, and filter conditions compare
//! `to_jsonb(t) -> 'field'` with a bound `jsonb` value. Every value and field
//! name in a predicate is a bind parameter; only table and column identifiers
//! of write payloads are spliced, and those are quoted.
//!
//! Transactions are plain `BEGIN` / `COMMIT` / `ROLLBACK` on the pooled
//! connection. A session dropped with a transaction open closes its
//! connection instead of returning it to the pool.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use tracing::{debug, info};

use crate::access::{nested, AggregateSpec, Filter, Operation, Query, QueryOutput};
use crate::config::Config;

use super::{Database, RowSecurityStatus, Session, StorageError};

/// Pooled PostgreSQL database.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Connect a pool sized from `cfg`.
    pub async fn connect(cfg: &Config) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.db_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .test_before_acquire(true)
            .connect(&cfg.database_url)
            .await?;
        info!(max_connections = cfg.db_max_connections, "storage pool connected");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PgDatabase {
    type Session = PgSession;

    async fn acquire(&self) -> Result<PgSession, StorageError> {
        Ok(PgSession {
            conn: self.pool.acquire().await?,
            in_transaction: false,
        })
    }
}

/// One pooled PostgreSQL connection.
pub struct PgSession {
    conn: PoolConnection<Postgres>,
    in_transaction: bool,
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if self.in_transaction {
            // The server rolls back when the connection closes.
            self.conn.close_on_drop();
        }
    }
}

macro_rules! bind_params {
    ($query:expr, $params:expr) => {{
        let mut q = $query;
        for p in $params {
            q = match p {
                Param::Text(s) => q.bind(s),
                Param::Json(v) => q.bind(Json(v)),
                Param::Int(n) => q.bind(n),
            };
        }
        q
    }};
}

impl PgSession {
    async fn simple(&mut self, sql: &str) -> Result<(), StorageError> {
        sqlx::query(sql).execute(&mut *self.conn).await?;
        Ok(())
    }

    async fn fetch_rows(&mut self, stmt: Statement) -> Result<Vec<Value>, StorageError> {
        let Statement { sql, params } = stmt;
        debug!(%sql, "fetch rows");
        let rows = bind_params!(sqlx::query_scalar::<_, Value>(&sql), params)
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(rows)
    }

    async fn fetch_row(&mut self, stmt: Statement) -> Result<Option<Value>, StorageError> {
        let Statement { sql, params } = stmt;
        debug!(%sql, "fetch row");
        let row = bind_params!(sqlx::query_scalar::<_, Value>(&sql), params)
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(row)
    }

    async fn fetch_count(&mut self, stmt: Statement) -> Result<u64, StorageError> {
        let Statement { sql, params } = stmt;
        debug!(%sql, "count");
        let n = bind_params!(sqlx::query_scalar::<_, i64>(&sql), params)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    async fn affected(&mut self, stmt: Statement) -> Result<u64, StorageError> {
        let Statement { sql, params } = stmt;
        debug!(%sql, "execute");
        let done = bind_params!(sqlx::query(&sql), params)
            .execute(&mut *self.conn)
            .await?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl Session for PgSession {
    async fn set_config(&mut self, name: &str, value: &str, is_local: bool) -> Result<(), StorageError> {
        sqlx::query("SELECT set_config($1, $2, $3)")
            .bind(name)
            .bind(value)
            .bind(is_local)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn current_config(&mut self, name: &str) -> Result<Option<String>, StorageError> {
        let value = sqlx::query_scalar::<_, Option<String>>("SELECT NULLIF(current_setting($1, true), '')")
            .bind(name)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(value)
    }

    async fn reset_config(&mut self, name: &str) -> Result<(), StorageError> {
        // RESET cannot take a bind parameter; an empty value reads back as unset.
        self.set_config(name, "", false).await
    }

    async fn begin(&mut self) -> Result<(), StorageError> {
        if self.in_transaction {
            return Err(StorageError::Transaction("transaction already in progress"));
        }
        self.simple("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        if !self.in_transaction {
            return Err(StorageError::Transaction("no transaction in progress"));
        }
        // Cleared first: a failed COMMIT still ends the transaction.
        self.in_transaction = false;
        self.simple("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        if !self.in_transaction {
            return Err(StorageError::Transaction("no transaction in progress"));
        }
        self.in_transaction = false;
        self.simple("ROLLBACK").await
    }

    async fn execute(&mut self, query: &Query) -> Result<QueryOutput, StorageError> {
        let table = quote_ident(&query.model);
        match &query.operation {
            Operation::FindMany {
                filter,
                order_by,
                skip,
                take,
            } => {
                let stmt = select(&table, filter, order_by.as_deref(), *skip, *take);
                self.fetch_rows(stmt).await.map(QueryOutput::Records)
            }
            Operation::FindFirst { filter } | Operation::FindUnique { key: filter } => {
                let stmt = select(&table, filter, None, None, Some(1));
                self.fetch_row(stmt).await.map(QueryOutput::Record)
            }
            Operation::Create { data } => self.fetch_row(insert(&table, data)?).await.map(QueryOutput::Record),
            Operation::CreateMany { data } => {
                if data.is_empty() {
                    return Ok(QueryOutput::Count(0));
                }
                self.affected(insert_many(&table, data)?).await.map(QueryOutput::Count)
            }
            Operation::Update { filter, data } => {
                let stmt = match update(&table, filter, data, true)? {
                    Some(stmt) => stmt,
                    None => select(&table, filter, None, None, Some(1)),
                };
                self.fetch_row(stmt).await.map(QueryOutput::Record)
            }
            Operation::UpdateMany { filter, data } => match update(&table, filter, data, false)? {
                Some(stmt) => self.affected(stmt).await.map(QueryOutput::Count),
                None => self.fetch_count(count(&table, filter)).await.map(QueryOutput::Count),
            },
            Operation::Upsert {
                filter,
                create,
                update: changes,
            } => {
                let existing = self
                    .fetch_row(select(&table, filter, None, None, Some(1)))
                    .await?;
                let stmt = match existing {
                    Some(_) => match update(&table, filter, changes, true)? {
                        Some(stmt) => stmt,
                        None => select(&table, filter, None, None, Some(1)),
                    },
                    None => insert(&table, create)?,
                };
                self.fetch_row(stmt).await.map(QueryOutput::Record)
            }
            Operation::Delete { filter } => self
                .fetch_row(delete(&table, filter, true))
                .await
                .map(QueryOutput::Record),
            Operation::DeleteMany { filter } => self
                .affected(delete(&table, filter, false))
                .await
                .map(QueryOutput::Count),
            Operation::Count { filter } => self.fetch_count(count(&table, filter)).await.map(QueryOutput::Count),
            Operation::Aggregate { filter, spec } => {
                let row = self.fetch_row(aggregate(&table, filter, spec)).await?;
                Ok(QueryOutput::Aggregate(row.unwrap_or(Value::Null)))
            }
        }
    }

    async fn row_security(&mut self, table: &str) -> Result<RowSecurityStatus, StorageError> {
        let row: Option<(bool, bool, i64)> = sqlx::query_as(
            "SELECT c.relrowsecurity, c.relforcerowsecurity, \
                    (SELECT count(*) FROM pg_policies p WHERE p.tablename = c.relname) \
             FROM pg_class c \
             WHERE c.relname = $1 AND c.relkind = 'r'",
        )
        .bind(table)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(row.map_or_else(RowSecurityStatus::default, |(enabled, forced, n)| RowSecurityStatus {
            enabled,
            forced,
            policy_count: u32::try_from(n).unwrap_or(u32::MAX),
        }))
    }
}

// ---------------------------------------------------------------------------
// Statement building
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Param {
    Text(String),
    Json(Value),
    Int(i64),
}

#[derive(Debug, Default)]
struct Statement {
    sql: String,
    params: Vec<Param>,
}

impl Statement {
    fn bind(&mut self, param: Param) -> String {
        self.params.push(param);
        let n = self.params.len();
        match self.params[n - 1] {
            Param::Text(_) => format!("${n}::text"),
            Param::Json(_) => format!("${n}::jsonb"),
            Param::Int(_) => format!("${n}::bigint"),
        }
    }

    /// Boolean SQL expression for `filter` over the row alias `alias`.
    fn predicate(&mut self, alias: &str, filter: &Filter) -> String {
        let mut parts = Vec::new();
        for (key, cond) in filter.as_map() {
            let part = match key.as_str() {
                "AND" => self.combine(alias, cond, " AND ", "TRUE"),
                "OR" => self.combine(alias, cond, " OR ", "FALSE"),
                "NOT" => format!("NOT {}", self.combine(alias, cond, " OR ", "FALSE")),
                field => {
                    let field = self.bind(Param::Text(field.to_owned()));
                    if cond.is_null() {
                        format!("coalesce(to_jsonb({alias}) -> {field}, 'null'::jsonb) = 'null'::jsonb")
                    } else {
                        let value = self.bind(Param::Json(cond.clone()));
                        format!("to_jsonb({alias}) -> {field} = {value}")
                    }
                }
            };
            parts.push(part);
        }
        if parts.is_empty() {
            "TRUE".into()
        } else {
            parts.join(" AND ")
        }
    }

    fn combine(&mut self, alias: &str, cond: &Value, op: &str, empty: &str) -> String {
        let parts: Vec<String> = nested(cond)
            .iter()
            .map(|f| format!("({})", self.predicate(alias, f)))
            .collect();
        if parts.is_empty() {
            empty.to_owned()
        } else {
            format!("({})", parts.join(op))
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn payload_columns(data: &Value) -> Result<Vec<String>, StorageError> {
    data.as_object()
        .map(|m| m.keys().map(|k| quote_ident(k)).collect())
        .ok_or_else(|| StorageError::Statement("write payload must be a JSON object".into()))
}

fn select(table: &str, filter: &Filter, order_by: Option<&str>, skip: Option<u64>, take: Option<u64>) -> Statement {
    let mut stmt = Statement::default();
    let pred = stmt.predicate("t", filter);
    let mut sql = format!("SELECT to_jsonb(t) FROM {table} AS t WHERE {pred}");
    if let Some(key) = order_by {
        let key = stmt.bind(Param::Text(key.to_owned()));
        sql.push_str(&format!(" ORDER BY to_jsonb(t) -> {key}"));
    }
    if let Some(n) = take {
        let n = stmt.bind(Param::Int(i64::try_from(n).unwrap_or(i64::MAX)));
        sql.push_str(&format!(" LIMIT {n}"));
    }
    if let Some(n) = skip {
        let n = stmt.bind(Param::Int(i64::try_from(n).unwrap_or(i64::MAX)));
        sql.push_str(&format!(" OFFSET {n}"));
    }
    stmt.sql = sql;
    stmt
}

fn count(table: &str, filter: &Filter) -> Statement {
    let mut stmt = Statement::default();
    let pred = stmt.predicate("t", filter);
    stmt.sql = format!("SELECT count(*) FROM {table} AS t WHERE {pred}");
    stmt
}

fn insert(table: &str, data: &Value) -> Result<Statement, StorageError> {
    let cols = payload_columns(data)?;
    let mut stmt = Statement::default();
    if cols.is_empty() {
        stmt.sql = format!("INSERT INTO {table} AS t DEFAULT VALUES RETURNING to_jsonb(t)");
        return Ok(stmt);
    }
    let record = stmt.bind(Param::Json(data.clone()));
    let list = cols.join(", ");
    let from_r = cols.iter().map(|c| format!("r.{c}")).collect::<Vec<_>>().join(", ");
    stmt.sql = format!(
        "INSERT INTO {table} AS t ({list}) \
         SELECT {from_r} FROM jsonb_populate_record(NULL::{table}, {record}) AS r \
         RETURNING to_jsonb(t)"
    );
    Ok(stmt)
}

fn insert_many(table: &str, data: &[Value]) -> Result<Statement, StorageError> {
    let mut cols: Vec<String> = Vec::new();
    for item in data {
        for col in payload_columns(item)? {
            if !cols.contains(&col) {
                cols.push(col);
            }
        }
    }
    let mut stmt = Statement::default();
    let records = stmt.bind(Param::Json(Value::Array(data.to_vec())));
    let list = cols.join(", ");
    let from_r = cols.iter().map(|c| format!("r.{c}")).collect::<Vec<_>>().join(", ");
    stmt.sql = format!(
        "INSERT INTO {table} ({list}) \
         SELECT {from_r} FROM jsonb_populate_recordset(NULL::{table}, {records}) AS r"
    );
    Ok(stmt)
}

/// `None` when the payload changes no column.
fn update(table: &str, filter: &Filter, data: &Value, single: bool) -> Result<Option<Statement>, StorageError> {
    let cols = payload_columns(data)?;
    if cols.is_empty() {
        return Ok(None);
    }
    let mut stmt = Statement::default();
    let record = stmt.bind(Param::Json(data.clone()));
    let set = cols
        .iter()
        .map(|c| format!("{c} = r.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let target = if single {
        let pred = stmt.predicate("s", filter);
        format!("t.ctid = (SELECT s.ctid FROM {table} AS s WHERE {pred} LIMIT 1)")
    } else {
        stmt.predicate("t", filter)
    };
    let returning = if single { " RETURNING to_jsonb(t)" } else { "" };
    stmt.sql = format!(
        "UPDATE {table} AS t SET {set} \
         FROM jsonb_populate_record(NULL::{table}, {record}) AS r \
         WHERE {target}{returning}"
    );
    Ok(Some(stmt))
}

fn delete(table: &str, filter: &Filter, single: bool) -> Statement {
    let mut stmt = Statement::default();
    stmt.sql = if single {
        let pred = stmt.predicate("s", filter);
        format!(
            "DELETE FROM {table} AS t \
             WHERE t.ctid = (SELECT s.ctid FROM {table} AS s WHERE {pred} LIMIT 1) \
             RETURNING to_jsonb(t)"
        )
    } else {
        let pred = stmt.predicate("t", filter);
        format!("DELETE FROM {table} AS t WHERE {pred}")
    };
    stmt
}

fn aggregate(table: &str, filter: &Filter, spec: &AggregateSpec) -> Statement {
    let mut stmt = Statement::default();
    let mut parts = Vec::new();
    if spec.count {
        parts.push("'_count', count(*)".to_owned());
    }
    let mut group = |stmt: &mut Statement, label: &str, fields: &[String], expr: &dyn Fn(&str) -> String| {
        if fields.is_empty() {
            return;
        }
        let inner = fields
            .iter()
            .map(|f| {
                let key = stmt.bind(Param::Text(f.clone()));
                format!("{key}, {}", expr(&key))
            })
            .collect::<Vec<_>>()
            .join(", ");
        parts.push(format!("'{label}', jsonb_build_object({inner})"));
    };
    group(&mut stmt, "_sum", &spec.sum, &|k| format!("sum((to_jsonb(t) ->> {k})::numeric)"));
    group(&mut stmt, "_avg", &spec.avg, &|k| format!("avg((to_jsonb(t) ->> {k})::numeric)"));
    group(&mut stmt, "_min", &spec.min, &|k| {
        format!(
            "(array_agg(to_jsonb(t) -> {k} ORDER BY to_jsonb(t) -> {k}) \
             FILTER (WHERE to_jsonb(t) -> {k} <> 'null'::jsonb))[1]"
        )
    });
    group(&mut stmt, "_max", &spec.max, &|k| {
        format!(
            "(array_agg(to_jsonb(t) -> {k} ORDER BY to_jsonb(t) -> {k} DESC) \
             FILTER (WHERE to_jsonb(t) -> {k} <> 'null'::jsonb))[1]"
        )
    });
    let pred = stmt.predicate("t", filter);
    stmt.sql = format!(
        "SELECT jsonb_build_object({}) FROM {table} AS t WHERE {pred}",
        parts.join(", ")
    );
    stmt
}
