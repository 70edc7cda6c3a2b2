//! Tenant scoping of data-access calls.
//!
//! For tenant-scoped entity types under a tenant scope:
//!
//! - predicates gain `tenantId = <session tenant>`, replacing any tenant
//!   condition the caller put at the top level;
//! - write payloads get `tenantId` stamped, overwriting caller values;
//! - unique lookups are checked after the fact and a record owned by another
//!   tenant is reported as "not found".
//!
//! Every call, scoped model or not, first re-asserts the session variable.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use common::GuardError;
use serde_json::Value;
use tracing::warn;

use crate::storage::Session;
use crate::tenant::id::truncate_id;
use crate::tenant::{Scope, TenantContext, TenantId, DEFAULT_TENANT_MODELS, TENANT_FIELD};

use super::{CallContext, Filter, Interceptor, Query, QueryOutput};

#[derive(Debug, Clone)]
pub struct QueryScoping {
    context: TenantContext,
    models: Arc<HashSet<String>>,
}

impl QueryScoping {
    pub fn new<I, S>(context: TenantContext, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            context,
            models: Arc::new(models.into_iter().map(Into::into).collect()),
        }
    }

    /// Scoping over [`DEFAULT_TENANT_MODELS`].
    pub fn with_defaults(context: TenantContext) -> Self {
        Self::new(context, DEFAULT_TENANT_MODELS.iter().copied())
    }

    pub fn is_scoped(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    /// Rewrite `query` so it can only touch `tenant`'s rows.
    fn scope_query(&self, tenant: &TenantId, query: &mut Query) -> Result<(), GuardError> {
        let op = query.operation.name();
        if let Some(filter) = query.operation.filter_mut() {
            merge_tenant(filter, tenant, &query.model, op);
        }
        for payload in query.operation.payloads_mut() {
            stamp_tenant(payload, tenant, &query.model, op)?;
        }
        Ok(())
    }
}

fn merge_tenant(filter: &mut Filter, tenant: &TenantId, model: &str, op: &str) {
    let session = Value::String(tenant.as_str().to_owned());
    if let Some(supplied) = filter.insert(TENANT_FIELD, session.clone()) {
        if supplied != session {
            warn!(
                model,
                operation = op,
                tenant = %tenant.short(),
                supplied = %supplied.as_str().map_or_else(|| "<non-string>".to_owned(), truncate_id),
                "caller tenant predicate overridden by session tenant"
            );
        }
    }
}

fn stamp_tenant(payload: &mut Value, tenant: &TenantId, model: &str, op: &str) -> Result<(), GuardError> {
    let Value::Object(map) = payload else {
        return Err(GuardError::Validation(format!(
            "{model}.{op}: write payload must be a JSON object"
        )));
    };
    map.insert(TENANT_FIELD.to_owned(), Value::String(tenant.as_str().to_owned()));
    Ok(())
}

#[async_trait]
impl Interceptor for QueryScoping {
    fn name(&self) -> &'static str {
        "query-scoping"
    }

    async fn before(
        &self,
        session: &mut dyn Session,
        ctx: &CallContext,
        query: &mut Query,
    ) -> Result<(), GuardError> {
        self.context
            .assert_scope(session, &ctx.scope, ctx.in_transaction)
            .await?;
        match &ctx.scope {
            Scope::Tenant(tenant) if self.is_scoped(&query.model) => self.scope_query(tenant, query),
            _ => Ok(()),
        }
    }

    fn after(&self, ctx: &CallContext, query: &Query, output: QueryOutput) -> QueryOutput {
        let Scope::Tenant(tenant) = &ctx.scope else {
            return output;
        };
        if !query.operation.is_unique_lookup() || !self.is_scoped(&query.model) {
            return output;
        }
        match output {
            QueryOutput::Record(Some(record)) => {
                let owner = record.get(TENANT_FIELD).and_then(Value::as_str);
                if owner == Some(tenant.as_str()) {
                    QueryOutput::Record(Some(record))
                } else {
                    warn!(
                        model = %query.model,
                        session_tenant = %tenant.short(),
                        record_tenant = %owner.map_or_else(|| "<none>".to_owned(), truncate_id),
                        "cross-tenant unique lookup suppressed"
                    );
                    QueryOutput::Record(None)
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Operation;
    use crate::storage::MockSession;
    use serde_json::json;

    const A: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
    const B: &str = "1b4e28ba-2fa1-41d2-883f-0016d3cca427";

    fn scoping() -> QueryScoping {
        QueryScoping::with_defaults(TenantContext::new("app.current_tenant_id"))
    }

    fn tenant_ctx(id: &str) -> CallContext {
        CallContext {
            scope: Scope::Tenant(TenantId::parse(id).unwrap()),
            in_transaction: true,
        }
    }

    fn session_expecting(value: &'static str, local: bool) -> MockSession {
        let mut session = MockSession::new();
        session
            .expect_set_config()
            .withf(move |name, v, l| name == "app.current_tenant_id" && v == value && *l == local)
            .times(1)
            .returning(|_, _, _| Ok(()));
        session
    }

    #[tokio::test]
    async fn caller_tenant_in_filter_is_overridden() {
        let mut session = session_expecting(A, true);
        let mut query = Query::find_many("Patient", Filter::eq(TENANT_FIELD, B).and("status", "x"));
        scoping()
            .before(&mut session, &tenant_ctx(A), &mut query)
            .await
            .unwrap();
        let filter = query.operation.filter().unwrap();
        assert_eq!(filter.get(TENANT_FIELD), Some(&json!(A)));
        assert_eq!(filter.get("status"), Some(&json!("x")));
    }

    #[tokio::test]
    async fn payloads_are_stamped() {
        let mut session = session_expecting(A, true);
        let mut query = Query::create_many(
            "Appointment",
            vec![json!({"tenantId": B, "notes": "n"}), json!({"notes": "m"})],
        );
        scoping()
            .before(&mut session, &tenant_ctx(A), &mut query)
            .await
            .unwrap();
        let Operation::CreateMany { data } = &query.operation else { unreachable!() };
        assert!(data.iter().all(|d| d[TENANT_FIELD] == A));
    }

    #[tokio::test]
    async fn upsert_scopes_filter_and_both_payloads() {
        let mut session = session_expecting(A, true);
        let mut query = Query::upsert("User", Filter::eq("id", "u1"), json!({}), json!({"tenantId": B}));
        scoping()
            .before(&mut session, &tenant_ctx(A), &mut query)
            .await
            .unwrap();
        let Operation::Upsert { filter, create, update } = &query.operation else { unreachable!() };
        assert_eq!(filter.get(TENANT_FIELD), Some(&json!(A)));
        assert_eq!(create[TENANT_FIELD], A);
        assert_eq!(update[TENANT_FIELD], A);
    }

    #[tokio::test]
    async fn non_object_payload_is_rejected() {
        let mut session = session_expecting(A, true);
        let mut query = Query::create("Patient", json!("oops"));
        let err = scoping()
            .before(&mut session, &tenant_ctx(A), &mut query)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[tokio::test]
    async fn unscoped_models_are_untouched_but_variable_reasserted() {
        let mut session = session_expecting(A, false);
        let mut query = Query::find_many("Vendor", Filter::all());
        let ctx = CallContext {
            in_transaction: false,
            ..tenant_ctx(A)
        };
        scoping().before(&mut session, &ctx, &mut query).await.unwrap();
        assert!(query.operation.filter().unwrap().is_empty());
    }

    #[tokio::test]
    async fn system_scope_is_a_bypass() {
        let mut session = session_expecting("", true);
        let mut query = Query::find_many("Patient", Filter::all());
        let ctx = CallContext {
            scope: Scope::System,
            in_transaction: true,
        };
        scoping().before(&mut session, &ctx, &mut query).await.unwrap();
        assert!(query.operation.filter().unwrap().is_empty());
    }

    #[test]
    fn unique_lookup_of_foreign_record_becomes_not_found() {
        let query = Query::find_unique("Patient", Filter::eq("id", "p1"));
        let foreign = QueryOutput::Record(Some(json!({"id": "p1", "tenantId": B})));
        let own = QueryOutput::Record(Some(json!({"id": "p1", "tenantId": A})));

        assert_eq!(scoping().after(&tenant_ctx(A), &query, foreign), QueryOutput::Record(None));
        assert!(matches!(
            scoping().after(&tenant_ctx(A), &query, own),
            QueryOutput::Record(Some(_))
        ));
    }

    #[test]
    fn unique_lookup_without_tenant_field_is_suppressed() {
        let query = Query::find_unique("Patient", Filter::eq("id", "p1"));
        let out = QueryOutput::Record(Some(json!({"id": "p1"})));
        assert_eq!(scoping().after(&tenant_ctx(A), &query, out), QueryOutput::Record(None));
    }
}
