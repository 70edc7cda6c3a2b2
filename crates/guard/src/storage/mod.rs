//! Storage seam: connections, session variables, transactions and queries.
//!
//! The guard consumes the relational engine through two traits:
//!
//! - [`Database`] hands out [`Session`]s (one pooled connection each).
//! - [`Session`] exposes the session configuration variables read by
//!   row-security policies, explicit transactions, query execution and the
//!   catalog lookup used by the health check.
//!
//! [`postgres::PgDatabase`] is the production engine. [`memory::MemoryDatabase`]
//! emulates the same row-security behavior in process.

pub mod memory;
pub mod postgres;

pub use memory::MemoryDatabase;
pub use postgres::PgDatabase;

use async_trait::async_trait;
use common::GuardError;
use thiserror::Error;

use crate::access::{Query, QueryOutput};

/// Errors raised by a storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A statement was rejected or failed.
    #[error("statement failed: {0}")]
    Statement(String),

    /// A write produced a row the active row-security policy does not allow.
    #[error("new row violates row-level security policy for table {0}")]
    PolicyViolation(String),

    /// A unique key collided with an existing row.
    #[error("duplicate key value violates unique constraint on {table}.{field}")]
    UniqueViolation { table: String, field: String },

    /// `begin` inside a transaction, or `commit`/`rollback` outside one.
    #[error("transaction state error: {0}")]
    Transaction(&'static str),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl From<StorageError> for GuardError {
    fn from(e: StorageError) -> Self {
        GuardError::Storage(e.to_string())
    }
}

/// Row-security state of one table as reported by the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowSecurityStatus {
    pub enabled: bool,
    /// Policies also apply to the table owner.
    pub forced: bool,
    pub policy_count: u32,
}

/// One acquired storage connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send {
    /// Set a configuration variable. With `is_local` the value ends with the
    /// current transaction; outside a transaction a local set has no effect.
    async fn set_config(&mut self, name: &str, value: &str, is_local: bool) -> Result<(), StorageError>;

    /// Read a configuration variable, `None` when it was never set.
    async fn current_config(&mut self, name: &str) -> Result<Option<String>, StorageError>;

    /// Reset a configuration variable to its default.
    async fn reset_config(&mut self, name: &str) -> Result<(), StorageError>;

    async fn begin(&mut self) -> Result<(), StorageError>;

    async fn commit(&mut self) -> Result<(), StorageError>;

    async fn rollback(&mut self) -> Result<(), StorageError>;

    /// Run one data-access call under the session's current variables.
    async fn execute(&mut self, query: &Query) -> Result<QueryOutput, StorageError>;

    /// Row-security state of `table`. Unknown tables report all-false.
    async fn row_security(&mut self, table: &str) -> Result<RowSecurityStatus, StorageError>;
}

/// Source of sessions.
#[async_trait]
pub trait Database: Send + Sync {
    type Session: Session + 'static;

    async fn acquire(&self) -> Result<Self::Session, StorageError>;
}
