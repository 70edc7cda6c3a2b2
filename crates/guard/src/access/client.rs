//! Tenant-scoped data-access client.

use std::sync::Arc;

use common::GuardError;
use serde_json::Value;
use tracing::debug;

use crate::storage::Session;
use crate::tenant::Scope;

use super::{AggregateSpec, CallContext, Filter, Interceptor, Query, QueryOutput};

/// Runs every call on one session through the interceptor chain.
///
/// `before` hooks run in registration order and `after` hooks in reverse.
pub struct ScopedClient<'s> {
    session: &'s mut dyn Session,
    ctx: CallContext,
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl<'s> ScopedClient<'s> {
    pub fn new(
        session: &'s mut dyn Session,
        scope: Scope,
        in_transaction: bool,
        interceptors: Arc<[Arc<dyn Interceptor>]>,
    ) -> Self {
        Self {
            session,
            ctx: CallContext {
                scope,
                in_transaction,
            },
            interceptors,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.ctx.scope
    }

    /// The underlying session, bypassing every interceptor.
    pub fn raw_session(&mut self) -> &mut dyn Session {
        &mut *self.session
    }

    pub async fn execute(&mut self, mut query: Query) -> Result<QueryOutput, GuardError> {
        for interceptor in self.interceptors.iter() {
            interceptor
                .before(&mut *self.session, &self.ctx, &mut query)
                .await?;
        }
        debug!(model = %query.model, operation = query.operation.name(), "executing");
        let mut output = self.session.execute(&query).await?;
        for interceptor in self.interceptors.iter().rev() {
            output = interceptor.after(&self.ctx, &query, output);
        }
        Ok(output)
    }

    pub async fn find_many(&mut self, model: &str, filter: Filter) -> Result<Vec<Value>, GuardError> {
        self.execute(Query::find_many(model, filter)).await?.into_records()
    }

    pub async fn find_first(&mut self, model: &str, filter: Filter) -> Result<Option<Value>, GuardError> {
        self.execute(Query::find_first(model, filter)).await?.into_record()
    }

    pub async fn find_unique(&mut self, model: &str, key: Filter) -> Result<Option<Value>, GuardError> {
        self.execute(Query::find_unique(model, key)).await?.into_record()
    }

    pub async fn create(&mut self, model: &str, data: Value) -> Result<Value, GuardError> {
        self.execute(Query::create(model, data))
            .await?
            .into_record()?
            .ok_or_else(|| GuardError::Internal(format!("{model}.create returned no record")))
    }

    pub async fn create_many(&mut self, model: &str, data: Vec<Value>) -> Result<u64, GuardError> {
        self.execute(Query::create_many(model, data)).await?.into_count()
    }

    /// `None` when no visible row matched.
    pub async fn update(&mut self, model: &str, filter: Filter, data: Value) -> Result<Option<Value>, GuardError> {
        self.execute(Query::update(model, filter, data)).await?.into_record()
    }

    pub async fn update_many(&mut self, model: &str, filter: Filter, data: Value) -> Result<u64, GuardError> {
        self.execute(Query::update_many(model, filter, data)).await?.into_count()
    }

    pub async fn upsert(
        &mut self,
        model: &str,
        filter: Filter,
        create: Value,
        update: Value,
    ) -> Result<Value, GuardError> {
        self.execute(Query::upsert(model, filter, create, update))
            .await?
            .into_record()?
            .ok_or_else(|| GuardError::Internal(format!("{model}.upsert returned no record")))
    }

    pub async fn delete(&mut self, model: &str, filter: Filter) -> Result<Option<Value>, GuardError> {
        self.execute(Query::delete(model, filter)).await?.into_record()
    }

    pub async fn delete_many(&mut self, model: &str, filter: Filter) -> Result<u64, GuardError> {
        self.execute(Query::delete_many(model, filter)).await?.into_count()
    }

    pub async fn count(&mut self, model: &str, filter: Filter) -> Result<u64, GuardError> {
        self.execute(Query::count(model, filter)).await?.into_count()
    }

    pub async fn aggregate(&mut self, model: &str, filter: Filter, spec: AggregateSpec) -> Result<Value, GuardError> {
        self.execute(Query::aggregate(model, filter, spec)).await?.into_aggregate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockSession;
    use crate::tenant::{TenantContext, TenantId};
    use crate::access::QueryScoping;
    use async_trait::async_trait;
    use mockall::Sequence;
    use serde_json::json;
    use std::sync::Mutex;

    const A: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

    /// Records hook order.
    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn before(
            &self,
            _session: &mut dyn Session,
            _ctx: &CallContext,
            _query: &mut Query,
        ) -> Result<(), GuardError> {
            self.log.lock().unwrap().push(format!("before:{}", self.label));
            Ok(())
        }

        fn after(&self, _ctx: &CallContext, _query: &Query, output: QueryOutput) -> QueryOutput {
            self.log.lock().unwrap().push(format!("after:{}", self.label));
            output
        }
    }

    #[tokio::test]
    async fn hooks_wrap_in_onion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Arc<[Arc<dyn Interceptor>]> = Arc::from(vec![
            Arc::new(Recorder { label: "one", log: log.clone() }) as Arc<dyn Interceptor>,
            Arc::new(Recorder { label: "two", log: log.clone() }),
        ]);
        let mut session = MockSession::new();
        session.expect_execute().times(1).returning(|_| Ok(QueryOutput::Count(0)));

        let mut client = ScopedClient::new(&mut session, Scope::System, false, chain);
        assert_eq!(client.count("Vendor", Filter::all()).await.unwrap(), 0);
        assert_eq!(
            *log.lock().unwrap(),
            ["before:one", "before:two", "after:two", "after:one"]
        );
    }

    #[tokio::test]
    async fn variable_is_reasserted_before_every_execute() {
        let scoping = QueryScoping::with_defaults(TenantContext::new("app.current_tenant_id"));
        let chain: Arc<[Arc<dyn Interceptor>]> = Arc::from(vec![Arc::new(scoping) as Arc<dyn Interceptor>]);

        let mut seq = Sequence::new();
        let mut session = MockSession::new();
        for _ in 0..2 {
            session
                .expect_set_config()
                .withf(|_, value, local| value == A && !*local)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Ok(()));
            session
                .expect_execute()
                .withf(|q| q.operation.filter().and_then(|f| f.get("tenantId")) == Some(&json!(A)))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(QueryOutput::Records(Vec::new())));
        }

        let tenant = Scope::Tenant(TenantId::parse(A).unwrap());
        let mut client = ScopedClient::new(&mut session, tenant, false, chain);
        client.find_many("Patient", Filter::all()).await.unwrap();
        client.find_many("Patient", Filter::all()).await.unwrap();
    }

    #[tokio::test]
    async fn failing_before_hook_skips_storage() {
        let scoping = QueryScoping::with_defaults(TenantContext::new("app.current_tenant_id"));
        let chain: Arc<[Arc<dyn Interceptor>]> = Arc::from(vec![Arc::new(scoping) as Arc<dyn Interceptor>]);
        let mut session = MockSession::new();
        session.expect_set_config().returning(|_, _, _| Ok(()));
        session.expect_execute().never();

        let tenant = Scope::Tenant(TenantId::parse(A).unwrap());
        let mut client = ScopedClient::new(&mut session, tenant, true, chain);
        let err = client.create("Patient", json!(["not", "an", "object"])).await.unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }
}
