//! Propagation of the current tenant to the storage session.
//!
//! A tenant id set at session level survives until cleared and can leak into
//! the next user of a pooled connection; the scoped entry points below set it
//! transaction-locally instead, so it ends with the transaction.

use std::sync::Arc;

use common::GuardError;
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::config::Config;
use crate::storage::{Database, Session};

use super::{Scope, TenantId};

/// Writes, reads and clears the tenant session variable.
#[derive(Debug, Clone)]
pub struct TenantContext {
    variable: Arc<str>,
}

impl TenantContext {
    pub fn new(variable: impl Into<Arc<str>>) -> Self {
        Self {
            variable: variable.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.tenant_variable.as_str())
    }

    /// Name of the session variable.
    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// Validate `tenant_id` and set it at session level on `session`.
    ///
    /// # Errors
    ///
    /// [`GuardError::Validation`] for a malformed id, raised before the
    /// session is touched; [`GuardError::Storage`] if the write fails.
    pub async fn set_context(
        &self,
        session: &mut dyn Session,
        tenant_id: &str,
    ) -> Result<TenantId, GuardError> {
        let tenant = TenantId::parse(tenant_id)?;
        session
            .set_config(&self.variable, tenant.as_str(), false)
            .await?;
        debug!(tenant = %tenant.short(), "tenant context set");
        Ok(tenant)
    }

    /// Write the variable for `scope`. Used to re-assert the scope before
    /// every intercepted call.
    pub async fn assert_scope(
        &self,
        session: &mut dyn Session,
        scope: &Scope,
        is_local: bool,
    ) -> Result<(), GuardError> {
        session
            .set_config(&self.variable, scope.variable_value(), is_local)
            .await?;
        Ok(())
    }

    /// Reset the variable. Never fails: a variable that was never set, or a
    /// session that refuses the reset, is only logged.
    pub async fn clear_context(&self, session: &mut dyn Session) {
        if let Err(e) = session.reset_config(&self.variable).await {
            debug!(error = %e, "tenant context reset failed; ignoring");
        }
    }

    /// Current value of the variable, `None` when unset or empty.
    pub async fn get_context(&self, session: &mut dyn Session) -> Option<String> {
        match session.current_config(&self.variable).await {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                warn!(error = %e, "failed to read tenant context");
                None
            }
        }
    }

    /// Run `f` in a transaction scoped to `tenant_id`.
    ///
    /// The variable is set transaction-locally. The transaction commits when
    /// `f` returns `Ok` and rolls back otherwise.
    ///
    /// # Errors
    ///
    /// [`GuardError::Validation`] for a malformed id, before any connection is
    /// acquired. Otherwise the storage error or the error returned by `f`.
    pub async fn with_tenant_scope<D, T, F>(
        &self,
        db: &D,
        tenant_id: &str,
        f: F,
    ) -> Result<T, GuardError>
    where
        D: Database,
        T: Send,
        F: for<'s> FnOnce(&'s mut dyn Session) -> BoxFuture<'s, Result<T, GuardError>> + Send,
    {
        let tenant = TenantId::parse(tenant_id)?;
        let mut session = db.acquire().await?;
        debug!(tenant = %tenant.short(), "entering tenant scope");
        self.run_scoped(&mut session, &Scope::Tenant(tenant), f).await
    }

    /// Run `f` in a transaction with row security bypassed.
    ///
    /// Every invocation is logged at warning level as a privileged operation,
    /// on entry and again with its outcome.
    pub async fn with_system_scope<D, T, F>(
        &self,
        db: &D,
        operation: &str,
        f: F,
    ) -> Result<T, GuardError>
    where
        D: Database,
        T: Send,
        F: for<'s> FnOnce(&'s mut dyn Session) -> BoxFuture<'s, Result<T, GuardError>> + Send,
    {
        warn!(privileged = true, operation, "entering system scope, row security bypassed");
        let result = match db.acquire().await {
            Ok(mut session) => self.run_scoped(&mut session, &Scope::System, f).await,
            Err(e) => Err(e.into()),
        };
        match &result {
            Ok(_) => warn!(privileged = true, operation, outcome = "success", "system scope finished"),
            Err(e) => warn!(privileged = true, operation, outcome = "failure", error = %e, "system scope finished"),
        }
        result
    }

    /// Begin, set the variable locally, run `f`, then commit or roll back.
    pub(crate) async fn run_scoped<T, F>(
        &self,
        session: &mut dyn Session,
        scope: &Scope,
        f: F,
    ) -> Result<T, GuardError>
    where
        F: for<'s> FnOnce(&'s mut dyn Session) -> BoxFuture<'s, Result<T, GuardError>>,
    {
        session.begin().await?;
        if let Err(e) = self.assert_scope(session, scope, true).await {
            rollback_quietly(session).await;
            return Err(e);
        }
        match f(&mut *session).await {
            Ok(value) => {
                session.commit().await?;
                Ok(value)
            }
            Err(e) => {
                rollback_quietly(session).await;
                Err(e)
            }
        }
    }
}

async fn rollback_quietly(session: &mut dyn Session) {
    if let Err(e) = session.rollback().await {
        warn!(error = %e, "rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MockSession, StorageError};
    use async_trait::async_trait;
    use mockall::Sequence;
    use std::sync::Mutex;

    const VAR: &str = "app.current_tenant_id";
    const TENANT: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

    /// Hands out one prepared mock session.
    struct OneSession(Mutex<Option<MockSession>>);

    #[async_trait]
    impl Database for OneSession {
        type Session = MockSession;

        async fn acquire(&self) -> Result<MockSession, StorageError> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| StorageError::Statement("pool exhausted".into()))
        }
    }

    fn ctx() -> TenantContext {
        TenantContext::new(VAR)
    }

    #[tokio::test]
    async fn set_context_rejects_before_touching_storage() {
        // No expectations: any call on the session panics.
        let mut session = MockSession::new();
        for raw in ["", "nope", "../../etc", "7c9e6679-7425-40de-944b"] {
            let err = ctx().set_context(&mut session, raw).await.unwrap_err();
            assert_eq!(err.code(), "validation_error");
        }
    }

    #[tokio::test]
    async fn set_context_writes_session_level() {
        let mut session = MockSession::new();
        session
            .expect_set_config()
            .withf(|name, value, local| name == VAR && value == TENANT && !*local)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let id = ctx().set_context(&mut session, TENANT).await.unwrap();
        assert_eq!(id.as_str(), TENANT);
    }

    #[tokio::test]
    async fn clear_context_tolerates_failure() {
        let mut session = MockSession::new();
        session
            .expect_reset_config()
            .returning(|_| Err(StorageError::Statement("unrecognized configuration parameter".into())));
        ctx().clear_context(&mut session).await;
    }

    #[tokio::test]
    async fn get_context_maps_empty_to_none() {
        let mut session = MockSession::new();
        session
            .expect_current_config()
            .times(1)
            .returning(|_| Ok(Some(String::new())));
        assert_eq!(ctx().get_context(&mut session).await, None);
    }

    #[tokio::test]
    async fn tenant_scope_commits_on_success() {
        let mut seq = Sequence::new();
        let mut session = MockSession::new();
        session.expect_begin().times(1).in_sequence(&mut seq).returning(|| Ok(()));
        session
            .expect_set_config()
            .withf(|name, value, local| name == VAR && value == TENANT && *local)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        session.expect_commit().times(1).in_sequence(&mut seq).returning(|| Ok(()));
        session.expect_rollback().never();

        let db = OneSession(Mutex::new(Some(session)));
        let out = ctx()
            .with_tenant_scope(&db, TENANT, |_session| Box::pin(async { Ok::<_, GuardError>(7) }))
            .await
            .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn tenant_scope_rolls_back_on_error() {
        let mut session = MockSession::new();
        session.expect_begin().times(1).returning(|| Ok(()));
        session.expect_set_config().times(1).returning(|_, _, _| Ok(()));
        session.expect_commit().never();
        session.expect_rollback().times(1).returning(|| Ok(()));

        let db = OneSession(Mutex::new(Some(session)));
        let err = ctx()
            .with_tenant_scope(&db, TENANT, |_session| {
                Box::pin(async { Err::<(), _>(GuardError::Internal("boom".into())) })
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "internal_error");
    }

    #[tokio::test]
    async fn tenant_scope_validates_before_acquiring() {
        let db = OneSession(Mutex::new(None));
        let err = ctx()
            .with_tenant_scope(&db, "bogus", |_session| Box::pin(async { Ok::<_, GuardError>(()) }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[tokio::test]
    async fn system_scope_sets_empty_variable() {
        let mut session = MockSession::new();
        session.expect_begin().returning(|| Ok(()));
        session
            .expect_set_config()
            .withf(|name, value, local| name == VAR && value.is_empty() && *local)
            .times(1)
            .returning(|_, _, _| Ok(()));
        session.expect_commit().times(1).returning(|| Ok(()));

        let db = OneSession(Mutex::new(Some(session)));
        ctx()
            .with_system_scope(&db, "test", |_session| Box::pin(async { Ok::<_, GuardError>(()) }))
            .await
            .unwrap();
    }
}
