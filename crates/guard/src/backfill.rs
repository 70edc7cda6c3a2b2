//! Backfill of plaintext sensitive fields.
//!
//! For each configured entity type the migrator counts the rows, then pages
//! through them ordered by `id`. A row is `encrypted` when at least one of its
//! sensitive fields still holds plaintext, `skipped` otherwise. Live runs
//! write back only the changed fields.
//!
//! Every page fetch and every row update runs in its own system-scope unit of
//! work. The migrator talks to sessions directly; it does not go through the
//! interceptor chain.

use std::sync::Arc;

use common::protocol::{MigrationSummary, ModelSummary};
use common::GuardError;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::access::encryption::audit_fields;
use crate::access::transform;
use crate::access::{FieldOp, Filter, Query};
use crate::config::Config;
use crate::crypto::FieldCipher;
use crate::fields::FieldTable;
use crate::storage::Database;
use crate::tenant::{TenantContext, TENANT_FIELD};

pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// Fields never written back by the migrator.
const PROTECTED_FIELDS: &[&str] = &["id", "createdAt", "updatedAt", TENANT_FIELD];

/// Longest error detail kept per row.
const MAX_DETAIL_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Report only; never write.
    pub dry_run: bool,
    pub batch_size: u64,
    /// Restrict the run to one configured entity type.
    pub model: Option<String>,
    /// Log every row decision.
    pub verbose: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
            model: None,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Encrypted,
    Skipped,
}

pub struct Migrator<D> {
    db: D,
    context: TenantContext,
    cipher: FieldCipher,
    fields: Arc<FieldTable>,
}

impl<D: Database> Migrator<D> {
    pub fn new(db: D, context: TenantContext, cipher: FieldCipher, fields: Arc<FieldTable>) -> Self {
        Self {
            db,
            context,
            cipher,
            fields,
        }
    }

    /// Build from process configuration.
    ///
    /// # Errors
    ///
    /// [`GuardError::Configuration`] when no usable key is configured or the
    /// field table cannot be loaded. Nothing is read before this check.
    pub fn from_config(db: D, cfg: &Config) -> Result<Self, GuardError> {
        if !cfg.has_encryption_key() {
            return Err(GuardError::Configuration(
                "FIELD_ENCRYPTION_KEY is not set; refusing to run the backfill".into(),
            ));
        }
        let cipher = FieldCipher::from_config(cfg).map_err(|e| GuardError::Configuration(e.to_string()))?;
        let fields = FieldTable::load(cfg).map_err(|e| GuardError::Configuration(format!("{e:#}")))?;
        Ok(Self::new(db, TenantContext::from_config(cfg), cipher, Arc::new(fields)))
    }

    /// Process every configured entity type, or only `opts.model`.
    ///
    /// # Errors
    ///
    /// Unknown model, zero batch size, or a failed count or page fetch. Row
    /// failures are recorded in the summary instead.
    pub async fn run(&self, opts: &MigrationOptions) -> Result<MigrationSummary, GuardError> {
        if opts.batch_size == 0 {
            return Err(GuardError::Validation("batch size must be at least 1".into()));
        }
        let models: Vec<String> = match &opts.model {
            Some(m) if self.fields.contains_model(m) => vec![m.clone()],
            Some(m) => {
                return Err(GuardError::Validation(format!(
                    "{m} is not a configured entity type"
                )))
            }
            None => self.fields.models().map(str::to_owned).collect(),
        };

        info!(dry_run = opts.dry_run, batch_size = opts.batch_size, models = models.len(), "backfill starting");
        let mut summary = MigrationSummary::new(opts.dry_run);
        for model in models {
            let result = self.migrate_model(&model, opts).await?;
            info!(
                model = %model,
                total = result.total,
                encrypted = result.encrypted,
                skipped = result.skipped,
                errors = result.errors,
                "entity type finished"
            );
            summary.push(result);
        }
        info!(
            encrypted = summary.totals.encrypted,
            skipped = summary.totals.skipped,
            errors = summary.totals.errors,
            "backfill finished"
        );
        Ok(summary)
    }

    async fn migrate_model(&self, model: &str, opts: &MigrationOptions) -> Result<ModelSummary, GuardError> {
        let fields: Arc<[String]> = self.fields.fields_for(model).into();
        let mut summary = ModelSummary::new(model);

        let count_query = Query::count(model, Filter::all());
        summary.total = self
            .context
            .with_system_scope(&self.db, "backfill.count", move |session| {
                Box::pin(async move { session.execute(&count_query).await?.into_count() })
            })
            .await?;

        let mut skip = 0;
        loop {
            let page_query = Query::page(model, Filter::all(), "id", skip, opts.batch_size);
            let page = self
                .context
                .with_system_scope(&self.db, "backfill.fetch", move |session| {
                    Box::pin(async move { session.execute(&page_query).await?.into_records() })
                })
                .await?;
            let fetched = page.len() as u64;

            for row in page {
                summary.processed += 1;
                let id = record_id(&row);
                match self.process_row(model, &fields, row, opts).await {
                    Ok(RowOutcome::Encrypted) => summary.encrypted += 1,
                    Ok(RowOutcome::Skipped) => summary.skipped += 1,
                    Err(e) => {
                        warn!(model, record_id = %id, error = %e, "row failed");
                        summary.record_error(id, short_detail(&e));
                    }
                }
            }

            skip += fetched;
            if fetched < opts.batch_size {
                break;
            }
        }
        Ok(summary)
    }

    async fn process_row(
        &self,
        model: &str,
        fields: &[String],
        row: Value,
        opts: &MigrationOptions,
    ) -> Result<RowOutcome, GuardError> {
        let Value::Object(map) = row else {
            return Err(GuardError::Internal("row is not an object".into()));
        };
        let id = map
            .get("id")
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| GuardError::Internal("row has no id".into()))?;

        let pending: Vec<&String> = fields
            .iter()
            .filter(|f| !PROTECTED_FIELDS.contains(&f.as_str()))
            .filter(|f| map.get(f.as_str()).is_some_and(|v| transform::pending_leaves(v) > 0))
            .collect();
        if pending.is_empty() {
            return Ok(RowOutcome::Skipped);
        }
        if opts.verbose {
            debug!(model, record_id = %id, fields = pending.len(), "row needs encryption");
        }
        if opts.dry_run {
            return Ok(RowOutcome::Encrypted);
        }

        let mut changes = Map::new();
        for field in pending {
            if let Some(value) = map.get(field.as_str()) {
                let sealed = transform::seal(value, &self.cipher)
                    .map_err(|e| GuardError::Encryption(format!("{field}: {e}")))?;
                changes.insert(field.clone(), sealed);
            }
        }

        let touched: Vec<String> = changes.keys().cloned().collect();
        let update = Query::update(model, Filter::eq("id", id.clone()), Value::Object(changes));
        let written = self
            .context
            .with_system_scope(&self.db, "backfill.update", move |session| {
                Box::pin(async move { session.execute(&update).await?.into_record() })
            })
            .await?;
        match written {
            Some(_) => {
                audit_fields(FieldOp::Encrypt, model, &touched, Some(&id));
                Ok(RowOutcome::Encrypted)
            }
            None => Err(GuardError::Storage("row disappeared before update".into())),
        }
    }
}

fn record_id(row: &Value) -> String {
    match row.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "<unknown>".to_owned(),
        Some(other) => other.to_string(),
    }
}

fn short_detail(e: &GuardError) -> String {
    let text = e.to_string();
    if text.chars().count() <= MAX_DETAIL_CHARS {
        text
    } else {
        let head: String = text.chars().take(MAX_DETAIL_CHARS).collect();
        format!("{head}...")
    }
}
