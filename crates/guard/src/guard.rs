//! Entry point for calling services.
//!
//! [`TenantGuard`] bundles the storage handle, the tenant context and the
//! interceptor chain (tenant scoping first, then field encryption), and
//! exposes the scoped units of work built on them.

use std::sync::Arc;

use anyhow::{Context, Result};
use common::protocol::HealthReport;
use common::GuardError;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::access::{EncryptionInterceptor, Interceptor, QueryScoping, ScopedClient, Selection};
use crate::config::Config;
use crate::crypto::FieldCipher;
use crate::fields::{FieldRegistry, FieldTable};
use crate::health::{self, DEFAULT_MIN_POLICY_COUNT};
use crate::storage::{Database, Session};
use crate::tenant::{Scope, TenantContext, TenantId, DEFAULT_TENANT_MODELS, TENANT_TABLE};

pub struct TenantGuard<D> {
    db: D,
    context: TenantContext,
    scoping: QueryScoping,
    encryption: EncryptionInterceptor,
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    tenant_models: Arc<[String]>,
    health_tables: Arc<[String]>,
    min_policy_count: u32,
}

impl<D: Database> TenantGuard<D> {
    /// Guard over `db` scoping [`DEFAULT_TENANT_MODELS`].
    pub fn new(db: D, context: TenantContext, cipher: FieldCipher, registry: FieldRegistry) -> Self {
        Self::with_models(db, context, cipher, registry, DEFAULT_TENANT_MODELS.iter().copied())
    }

    pub fn with_models<I, S>(
        db: D,
        context: TenantContext,
        cipher: FieldCipher,
        registry: FieldRegistry,
        tenant_models: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tenant_models: Arc<[String]> = tenant_models.into_iter().map(Into::into).collect();
        let scoping = QueryScoping::new(context.clone(), tenant_models.iter().cloned());
        let encryption = EncryptionInterceptor::new(cipher, registry);
        let interceptors = chain(&scoping, &encryption);
        let health_tables = default_health_tables(&tenant_models);
        Self {
            db,
            context,
            scoping,
            encryption,
            interceptors,
            tenant_models,
            health_tables,
            min_policy_count: DEFAULT_MIN_POLICY_COUNT,
        }
    }

    /// Build from process configuration.
    ///
    /// # Errors
    ///
    /// Fails when the encryption key is unusable or the field table cannot be
    /// loaded.
    pub fn from_config(db: D, cfg: &Config) -> Result<Self> {
        let cipher = FieldCipher::from_config(cfg).context("field encryption key is unusable")?;
        let registry = FieldRegistry::new(FieldTable::load(cfg)?);
        let mut guard = Self::new(db, TenantContext::from_config(cfg), cipher, registry);
        guard.min_policy_count = cfg.min_policy_count;
        Ok(guard)
    }

    /// Policies a table needs to be reported healthy.
    pub fn with_min_policy_count(mut self, n: u32) -> Self {
        self.min_policy_count = n;
        self
    }

    /// Check `tables` in addition to the tenant-scoped entity types and the
    /// tenant table.
    pub fn with_health_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = self.health_tables.to_vec();
        for table in tables {
            let table = table.into();
            if !all.contains(&table) {
                all.push(table);
            }
        }
        self.health_tables = all.into();
        self
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    pub fn context(&self) -> &TenantContext {
        &self.context
    }

    pub fn tenant_models(&self) -> &[String] {
        &self.tenant_models
    }

    /// Tables the health check reports on.
    pub fn health_tables(&self) -> &[String] {
        &self.health_tables
    }

    /// Run `f` with a client scoped to `tenant_id`, inside one transaction.
    ///
    /// # Errors
    ///
    /// [`GuardError::Validation`] for a malformed id before any storage
    /// interaction; otherwise whatever storage or `f` returned. The
    /// transaction is rolled back on every error.
    pub async fn with_tenant_scope<T, F>(&self, tenant_id: &str, f: F) -> Result<T, GuardError>
    where
        T: Send,
        F: for<'c> FnOnce(ScopedClient<'c>) -> BoxFuture<'c, Result<T, GuardError>> + Send,
    {
        let tenant = TenantId::parse(tenant_id)?;
        let interceptors = self.interceptors.clone();
        self.context
            .with_tenant_scope(&self.db, tenant_id, move |session| {
                f(ScopedClient::new(session, Scope::Tenant(tenant), true, interceptors))
            })
            .await
    }

    /// Run `f` with a client that bypasses row security. Logged as privileged.
    pub async fn with_system_scope<T, F>(&self, operation: &str, f: F) -> Result<T, GuardError>
    where
        T: Send,
        F: for<'c> FnOnce(ScopedClient<'c>) -> BoxFuture<'c, Result<T, GuardError>> + Send,
    {
        let interceptors = self.interceptors.clone();
        self.context
            .with_system_scope(&self.db, operation, move |session| {
                f(ScopedClient::new(session, Scope::System, true, interceptors))
            })
            .await
    }

    /// A client bound to `session` at session level, for callers managing
    /// their own connection. The variable is re-asserted before every call.
    pub async fn scoped_client<'s>(
        &self,
        session: &'s mut dyn Session,
        tenant_id: &str,
    ) -> Result<ScopedClient<'s>, GuardError> {
        let tenant = self.context.set_context(session, tenant_id).await?;
        Ok(ScopedClient::new(
            session,
            Scope::Tenant(tenant),
            false,
            self.interceptors.clone(),
        ))
    }

    /// A guard sharing this one's storage and scoping, with `selection`
    /// applied to field encryption.
    pub fn selective(&self, selection: Selection) -> Self
    where
        D: Clone,
    {
        let encryption = self.encryption.selective(selection);
        Self {
            db: self.db.clone(),
            context: self.context.clone(),
            interceptors: chain(&self.scoping, &encryption),
            scoping: self.scoping.clone(),
            encryption,
            tenant_models: self.tenant_models.clone(),
            health_tables: self.health_tables.clone(),
            min_policy_count: self.min_policy_count,
        }
    }

    /// Seal one record outside the interceptor chain.
    pub fn encrypt_record(&self, model: &str, record: &Value) -> Result<Value, GuardError> {
        self.encryption.encrypt_record(model, record)
    }

    /// Open one record outside the interceptor chain.
    pub fn decrypt_record(&self, model: &str, record: &Value) -> Value {
        self.encryption.decrypt_record(model, record)
    }

    /// Row-security report over [`Self::health_tables`].
    pub async fn health_check(&self) -> Result<HealthReport, GuardError> {
        let mut session = self.db.acquire().await?;
        Ok(health::run_health_check(&mut session, &self.health_tables, self.min_policy_count).await)
    }
}

/// The tenant-scoped entity types followed by the tenant table.
fn default_health_tables(tenant_models: &[String]) -> Arc<[String]> {
    let mut tables = tenant_models.to_vec();
    if !tables.iter().any(|t| t == TENANT_TABLE) {
        tables.push(TENANT_TABLE.to_owned());
    }
    tables.into()
}

fn chain(scoping: &QueryScoping, encryption: &EncryptionInterceptor) -> Arc<[Arc<dyn Interceptor>]> {
    Arc::from(vec![
        Arc::new(scoping.clone()) as Arc<dyn Interceptor>,
        Arc::new(encryption.clone()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::crypto::cipher::test_cipher;
    use crate::crypto::is_envelope;
    use crate::storage::MemoryDatabase;
    use crate::access::Filter;
    use common::protocol::CheckStatus;
    use serde_json::json;

    const A: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
    const B: &str = "1b4e28ba-2fa1-41d2-883f-0016d3cca427";

    fn guard() -> TenantGuard<MemoryDatabase> {
        TenantGuard::new(
            MemoryDatabase::new(),
            TenantContext::new("app.current_tenant_id"),
            test_cipher(),
            FieldRegistry::default(),
        )
    }

    #[test]
    fn from_config_builds() {
        let g = TenantGuard::from_config(MemoryDatabase::new(), &test_config()).unwrap();
        assert_eq!(g.tenant_models().len(), DEFAULT_TENANT_MODELS.len());
        assert_eq!(g.context().variable(), "app.current_tenant_id");
    }

    #[test]
    fn health_tables_include_tenant_table() {
        let g = guard();
        let tables = g.health_tables();
        assert_eq!(tables.len(), DEFAULT_TENANT_MODELS.len() + 1);
        assert_eq!(tables.last().map(String::as_str), Some(TENANT_TABLE));

        let g = guard().with_health_tables(["AuditLog", "Tenant"]);
        assert_eq!(g.health_tables().len(), DEFAULT_TENANT_MODELS.len() + 2);
        assert_eq!(g.health_tables().last().map(String::as_str), Some("AuditLog"));
    }

    #[tokio::test]
    async fn health_check_flags_unprotected_tenant_table() {
        let db = MemoryDatabase::new();
        for model in DEFAULT_TENANT_MODELS {
            db.enable_row_security(model, true, 4);
        }
        let g = TenantGuard::new(
            db.clone(),
            TenantContext::new("app.current_tenant_id"),
            test_cipher(),
            FieldRegistry::default(),
        );
        let report = g.health_check().await.unwrap();
        assert!(!report.healthy);
        let tenant = report.tables.iter().find(|t| t.table == TENANT_TABLE).unwrap();
        assert_eq!(tenant.status, CheckStatus::Error);

        db.enable_row_security(TENANT_TABLE, true, 4);
        let report = g.health_check().await.unwrap();
        assert!(report.healthy);
        assert_eq!(report.verdict, CheckStatus::Ok);
    }

    #[tokio::test]
    async fn writes_are_stamped_and_sealed_at_rest() {
        let g = guard();
        let created = g
            .with_tenant_scope(A, |mut client| {
                Box::pin(async move {
                    client
                        .create("Appointment", json!({"id": "a1", "tenantId": B, "notes": "bring forms"}))
                        .await
                })
            })
            .await
            .unwrap();
        assert_eq!(created["notes"], "bring forms");
        assert_eq!(created["tenantId"], A);

        let stored = &g.database().rows("Appointment")[0];
        assert!(is_envelope(stored["notes"].as_str().unwrap()));
        assert_eq!(stored["tenantId"], A);
    }

    #[tokio::test]
    async fn failed_unit_of_work_rolls_back() {
        let g = guard();
        let err = g
            .with_tenant_scope(A, |mut client| {
                Box::pin(async move {
                    client.create("Patient", json!({"id": "p1"})).await?;
                    Err::<(), _>(GuardError::Internal("abort".into()))
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "internal_error");
        assert!(g.database().rows("Patient").is_empty());
    }

    #[tokio::test]
    async fn session_level_client_stays_scoped() {
        let g = guard();
        g.database().seed(
            "Patient",
            vec![json!({"id": "p1", "tenantId": A}), json!({"id": "p2", "tenantId": B})],
        );
        let mut session = g.database().acquire().await.unwrap();
        let mut client = g.scoped_client(&mut session, A).await.unwrap();
        let rows = client.find_many("Patient", Filter::all()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(client.find_unique("Patient", Filter::eq("id", "p2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scoped_client_rejects_bad_id() {
        let g = guard();
        let mut session = g.database().acquire().await.unwrap();
        assert!(g.scoped_client(&mut session, "tenant-1").await.is_err());
    }

    #[test]
    fn record_helpers_round_trip() {
        let g = guard();
        let record = json!({"id": "v1", "address": "9 Elm", "taxId": "12-3456789"});
        let sealed = g.encrypt_record("Vendor", &record).unwrap();
        assert!(is_envelope(sealed["address"].as_str().unwrap()));
        assert_eq!(g.decrypt_record("Vendor", &sealed), record);
    }

    #[tokio::test]
    async fn selective_guard_narrows_encryption() {
        let g = guard().selective(Selection {
            exclude_models: vec!["Appointment".into()],
            ..Selection::default()
        });
        g.with_system_scope("test", |mut client| {
            Box::pin(async move {
                client
                    .create("Appointment", json!({"id": "a1", "tenantId": A, "notes": "plain"}))
                    .await
            })
        })
        .await
        .unwrap();
        assert_eq!(g.database().rows("Appointment")[0]["notes"], "plain");
    }
}
