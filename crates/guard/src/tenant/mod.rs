//! Tenant identity and the session variable that carries it to storage.
//!
//! The storage engine's row-security policies read one namespaced session
//! variable. [`TenantContext`] owns writing, reading and clearing it, and the
//! scoped units of work that set it transaction-locally.

pub mod context;
pub mod id;

pub use context::TenantContext;
pub use id::TenantId;

/// Attribute every tenant-scoped record carries.
pub const TENANT_FIELD: &str = "tenantId";

/// Entity types scoped by tenant when no explicit list is configured.
pub const DEFAULT_TENANT_MODELS: &[&str] = &[
    "User",
    "Patient",
    "Provider",
    "Appointment",
    "Encounter",
    "Document",
];

/// Table holding the tenants themselves. Not tenant-scoped by the
/// interceptor, but protected by a row-security policy all the same.
pub const TENANT_TABLE: &str = "Tenant";

/// Who a unit of work acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Restricted to one tenant's rows.
    Tenant(TenantId),
    /// Privileged bypass. The session variable is set to the empty string,
    /// which the policies treat as "no restriction".
    System,
}

impl Scope {
    pub fn tenant(&self) -> Option<&TenantId> {
        match self {
            Scope::Tenant(id) => Some(id),
            Scope::System => None,
        }
    }

    /// Value written into the session variable.
    pub fn variable_value(&self) -> &str {
        match self {
            Scope::Tenant(id) => id.as_str(),
            Scope::System => "",
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Scope::System)
    }
}
