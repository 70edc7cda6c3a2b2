//! Tenant scoping and transparent field encryption for multi-tenant data
//! access.
//!
//! Requests enter with a tenant id. [`TenantGuard::with_tenant_scope`] opens a
//! transaction with the tenant set as a transaction-local session variable
//! (read by the storage engine's row-security policies) and hands the caller a
//! [`ScopedClient`]. Every call on that client passes through two
//! interceptors:
//!
//! 1. [`access::QueryScoping`] re-asserts the session variable, narrows
//!    predicates to the session tenant, stamps write payloads and validates
//!    unique lookups after the fact.
//! 2. [`access::EncryptionInterceptor`] seals sensitive fields on the way in
//!    and opens them on the way out.
//!
//! [`backfill::Migrator`] brings existing rows up to the encrypted invariant.

pub mod access;
pub mod backfill;
pub mod config;
pub mod crypto;
pub mod fields;
pub mod guard;
pub mod health;
pub mod storage;
pub mod telemetry;
pub mod tenant;

pub use access::{Filter, Query, QueryOutput, ScopedClient, Selection};
pub use common::GuardError;
pub use config::Config;
pub use crypto::FieldCipher;
pub use fields::{FieldRegistry, FieldTable};
pub use guard::TenantGuard;
pub use tenant::{Scope, TenantContext, TenantId};
