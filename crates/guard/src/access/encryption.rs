//! Transparent encryption of sensitive fields.
//!
//! Write payloads are sealed before they reach storage; returned records are
//! opened before they reach the caller. Which fields are sensitive comes from
//! the [`FieldRegistry`], optionally widened or narrowed by a [`Selection`].
//!
//! Sealing failures abort the write. Opening failures are per field: the
//! stored value is returned and a warning is logged.
//!
//! Every field actually sealed or opened emits one `audit` event carrying
//! the model, the field and the masked record id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::GuardError;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::crypto::{mask_field, CipherError, FieldCipher};
use crate::crypto::mask::DEFAULT_VISIBLE;
use crate::fields::FieldRegistry;
use crate::storage::Session;
use crate::tenant::TENANT_FIELD;

use super::transform::{self, OpenFailure};
use super::{CallContext, Interceptor, Query, QueryOutput};

/// Call-site adjustments to the configured field lists.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// When non-empty, only these entity types are encrypted.
    pub include_models: Vec<String>,
    /// Entity types left alone.
    pub exclude_models: Vec<String>,
    /// Extra fields per entity type.
    pub additional_fields: HashMap<String, Vec<String>>,
    /// Configured fields to skip per entity type.
    pub exclude_fields: HashMap<String, Vec<String>>,
}

impl Selection {
    pub fn applies_to(&self, model: &str) -> bool {
        let included = self.include_models.is_empty() || self.include_models.iter().any(|m| m == model);
        included && !self.exclude_models.iter().any(|m| m == model)
    }

    fn resolve(&self, model: &str, base: &[String]) -> Vec<String> {
        if !self.applies_to(model) {
            return Vec::new();
        }
        let excluded = self.exclude_fields.get(model);
        let mut fields: Vec<String> = base
            .iter()
            .filter(|f| excluded.map_or(true, |ex| !ex.contains(*f)))
            .cloned()
            .collect();
        for extra in self.additional_fields.get(model).into_iter().flatten() {
            if extra != TENANT_FIELD && !fields.contains(extra) {
                fields.push(extra.clone());
            }
        }
        fields
    }
}

#[derive(Debug, Clone)]
pub struct EncryptionInterceptor {
    cipher: FieldCipher,
    registry: FieldRegistry,
    selection: Option<Arc<Selection>>,
}

impl EncryptionInterceptor {
    pub fn new(cipher: FieldCipher, registry: FieldRegistry) -> Self {
        Self {
            cipher,
            registry,
            selection: None,
        }
    }

    /// A copy of this interceptor with `selection` applied on top of the
    /// registry. The registry itself is not changed.
    pub fn selective(&self, selection: Selection) -> Self {
        Self {
            selection: Some(Arc::new(selection)),
            ..self.clone()
        }
    }

    /// Sensitive fields of `model` for this interceptor.
    pub fn fields_for(&self, model: &str) -> Vec<String> {
        let table = self.registry.snapshot();
        let base = table.fields_for(model);
        match &self.selection {
            Some(selection) => selection.resolve(model, base),
            None => base.to_vec(),
        }
    }

    /// Seal the sensitive fields of one record.
    ///
    /// # Errors
    ///
    /// [`GuardError::Encryption`] if any field fails to encrypt.
    pub fn encrypt_record(&self, model: &str, record: &Value) -> Result<Value, GuardError> {
        let fields = self.fields_for(model);
        let (sealed, touched) =
            seal_fields(record, &fields, &self.cipher).map_err(|e| seal_failed(model, &e))?;
        audit_fields(FieldOp::Encrypt, model, &touched, record.get("id"));
        Ok(sealed)
    }

    /// Open the sensitive fields of one record. Fields that fail to decrypt
    /// keep their stored value.
    pub fn decrypt_record(&self, model: &str, record: &Value) -> Value {
        let fields = self.fields_for(model);
        let mut failures = Vec::new();
        let (opened, touched) = open_fields(record, &fields, &self.cipher, &mut failures);
        audit_fields(FieldOp::Decrypt, model, &touched, record.get("id"));
        for (field, failure) in &failures {
            warn!(
                model,
                field = %field,
                path = %failure.path,
                reason = %failure.reason,
                "field decryption failed; returning stored value"
            );
        }
        opened
    }
}

/// Direction of a field audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    Encrypt,
    Decrypt,
}

impl FieldOp {
    pub fn event_name(self) -> &'static str {
        match self {
            FieldOp::Encrypt => "FIELD_ENCRYPT",
            FieldOp::Decrypt => "FIELD_DECRYPT",
        }
    }
}

/// Emit one audit event per field in `fields`. The record id is masked.
pub(crate) fn audit_fields(op: FieldOp, model: &str, fields: &[String], record_id: Option<&Value>) {
    if fields.is_empty() {
        return;
    }
    let record_id = match record_id {
        Some(Value::String(id)) => mask_field(id, DEFAULT_VISIBLE),
        Some(Value::Number(n)) => mask_field(&n.to_string(), DEFAULT_VISIBLE),
        _ => "<none>".to_owned(),
    };
    for field in fields {
        info!(
            target: "audit",
            event = op.event_name(),
            model,
            field = %field,
            record_id = %record_id,
            "sensitive field processed"
        );
    }
}

/// Log and convert a write-path cipher failure.
pub(crate) fn seal_failed(model: &str, e: &CipherError) -> GuardError {
    error!(model, error = %e, "field encryption failed; write aborted");
    GuardError::Encryption(format!("{model}: {e}"))
}

/// Rebuild `record` with each listed field sealed. Also returns the fields
/// that held plaintext.
pub(crate) fn seal_fields(
    record: &Value,
    fields: &[String],
    cipher: &FieldCipher,
) -> Result<(Value, Vec<String>), CipherError> {
    let Value::Object(map) = record else {
        return Ok((record.clone(), Vec::new()));
    };
    let mut out = Map::with_capacity(map.len());
    let mut touched = Vec::new();
    for (key, value) in map {
        let value = if key != TENANT_FIELD && fields.contains(key) {
            if transform::pending_leaves(value) > 0 {
                touched.push(key.clone());
            }
            transform::seal(value, cipher)?
        } else {
            value.clone()
        };
        out.insert(key.clone(), value);
    }
    Ok((Value::Object(out), touched))
}

fn open_fields(
    record: &Value,
    fields: &[String],
    cipher: &FieldCipher,
    failures: &mut Vec<(String, OpenFailure)>,
) -> (Value, Vec<String>) {
    let Value::Object(map) = record else {
        return (record.clone(), Vec::new());
    };
    let mut out = Map::with_capacity(map.len());
    let mut touched = Vec::new();
    for (key, value) in map {
        let value = if fields.contains(key) {
            let mut leaf_failures = Vec::new();
            let opened = transform::open(value, cipher, &mut leaf_failures);
            if leaf_failures.is_empty() && opened != *value {
                touched.push(key.clone());
            }
            failures.extend(leaf_failures.into_iter().map(|f| (key.clone(), f)));
            opened
        } else {
            value.clone()
        };
        out.insert(key.clone(), value);
    }
    (Value::Object(out), touched)
}

#[async_trait]
impl Interceptor for EncryptionInterceptor {
    fn name(&self) -> &'static str {
        "field-encryption"
    }

    async fn before(
        &self,
        _session: &mut dyn Session,
        _ctx: &CallContext,
        query: &mut Query,
    ) -> Result<(), GuardError> {
        let model = query.model.clone();
        let payloads = query.operation.payloads_mut();
        if payloads.is_empty() {
            return Ok(());
        }
        for payload in payloads {
            *payload = self.encrypt_record(&model, payload)?;
        }
        debug!(model = %model, "write payload sealed");
        Ok(())
    }

    fn after(&self, _ctx: &CallContext, query: &Query, output: QueryOutput) -> QueryOutput {
        output.map_records(|record| self.decrypt_record(&query.model, &record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{Filter, Operation, ScopedClient};
    use crate::crypto::cipher::{tamper, test_cipher};
    use crate::crypto::is_envelope;
    use crate::storage::MockSession;
    use crate::tenant::Scope;
    use serde_json::json;

    fn interceptor() -> EncryptionInterceptor {
        EncryptionInterceptor::new(test_cipher(), FieldRegistry::default())
    }

    fn ctx() -> CallContext {
        CallContext {
            scope: Scope::System,
            in_transaction: true,
        }
    }

    #[test]
    fn only_configured_fields_are_sealed() {
        let sealed = interceptor()
            .encrypt_record(
                "Caregiver",
                &json!({"id": "c1", "tenantId": "t", "phone": "555", "name": "Kim", "ssn": "123-45-6789"}),
            )
            .unwrap();
        assert!(is_envelope(sealed["phone"].as_str().unwrap()));
        assert!(is_envelope(sealed["ssn"].as_str().unwrap()));
        assert_eq!(sealed["name"], "Kim");
        assert_eq!(sealed["tenantId"], "t");
        assert_eq!(sealed["id"], "c1");
    }

    #[test]
    fn structured_field_round_trips() {
        let e = interceptor();
        let contact = json!({"name": "Lee", "phone": "555-0101", "age": 61, "primary": true});
        let record = json!({"id": "p1", "emergencyContact": contact});
        let sealed = e.encrypt_record("Patient", &record).unwrap();
        assert!(is_envelope(sealed["emergencyContact"]["name"].as_str().unwrap()));
        assert_eq!(sealed["emergencyContact"]["age"], 61);
        assert_eq!(e.decrypt_record("Patient", &sealed), record);
    }

    #[test]
    fn one_corrupted_field_does_not_affect_siblings() {
        let e = interceptor();
        let record = json!({"address": "1 Main St", "city": "Springfield", "gateCode": "4321"});
        let mut sealed = e.encrypt_record("PatientHome", &record).unwrap();
        let broken = tamper(sealed["city"].as_str().unwrap());
        sealed["city"] = json!(broken.clone());

        let opened = e.decrypt_record("PatientHome", &sealed);
        assert_eq!(opened["address"], "1 Main St");
        assert_eq!(opened["gateCode"], "4321");
        assert_eq!(opened["city"], json!(broken));
    }

    #[test]
    fn selection_widens_and_narrows() {
        let selection = Selection {
            additional_fields: HashMap::from([(
                "Caregiver".to_owned(),
                vec!["name".to_owned(), TENANT_FIELD.to_owned()],
            )]),
            exclude_fields: HashMap::from([("Caregiver".to_owned(), vec!["email".to_owned()])]),
            ..Selection::default()
        };
        let e = interceptor().selective(selection);
        let fields = e.fields_for("Caregiver");
        assert!(fields.contains(&"name".to_owned()));
        assert!(!fields.contains(&"email".to_owned()));
        assert!(!fields.contains(&TENANT_FIELD.to_owned()));
        // The base interceptor is unchanged.
        assert!(interceptor().fields_for("Caregiver").contains(&"email".to_owned()));
    }

    #[test]
    fn selection_model_filters() {
        let only_users = Selection {
            include_models: vec!["User".into()],
            ..Selection::default()
        };
        let e = interceptor().selective(only_users);
        assert!(e.fields_for("Patient").is_empty());
        assert!(!e.fields_for("User").is_empty());

        let no_users = Selection {
            exclude_models: vec!["User".into()],
            ..Selection::default()
        };
        assert!(interceptor().selective(no_users).fields_for("User").is_empty());
    }

    #[tokio::test]
    async fn before_seals_every_payload_of_upsert() {
        let mut session = MockSession::new();
        let mut query = Query::upsert(
            "Appointment",
            Filter::eq("id", "a1"),
            json!({"notes": "create"}),
            json!({"notes": "update"}),
        );
        interceptor().before(&mut session, &ctx(), &mut query).await.unwrap();
        let Operation::Upsert { create, update, .. } = &query.operation else { unreachable!() };
        assert!(is_envelope(create["notes"].as_str().unwrap()));
        assert!(is_envelope(update["notes"].as_str().unwrap()));
    }

    #[tokio::test]
    async fn before_leaves_reads_alone() {
        let mut session = MockSession::new();
        let mut query = Query::find_many("Appointment", Filter::eq("notes", "plain"));
        let before = query.clone();
        interceptor().before(&mut session, &ctx(), &mut query).await.unwrap();
        assert_eq!(query, before);
    }

    #[test]
    fn sealing_reports_only_plaintext_fields() {
        let cipher = test_cipher();
        let fields = vec!["phone".to_owned(), "email".to_owned(), "homeAddress".to_owned()];
        let already = cipher.encrypt("a@example.org").unwrap();
        let record = json!({
            "id": "c1",
            "phone": "555-0100",
            "email": already,
            "homeAddress": {"zip": 12345},
            "name": "Kim"
        });
        let (sealed, touched) = seal_fields(&record, &fields, &cipher).unwrap();
        assert_eq!(touched, ["phone"]);
        assert_eq!(sealed["email"], record["email"]);
    }

    #[test]
    fn opening_reports_only_decrypted_fields() {
        let cipher = test_cipher();
        let fields = vec!["address".to_owned(), "city".to_owned(), "state".to_owned()];
        let (mut sealed, _) = seal_fields(
            &json!({"address": "1 Main St", "city": "Springfield"}),
            &fields,
            &cipher,
        )
        .unwrap();
        sealed["city"] = json!(tamper(sealed["city"].as_str().unwrap()));
        sealed["state"] = json!("IL");

        let mut failures = Vec::new();
        let (_, touched) = open_fields(&sealed, &fields, &cipher, &mut failures);
        assert_eq!(touched, ["address"]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "city");
    }

    #[test]
    fn field_op_names() {
        assert_eq!(FieldOp::Encrypt.event_name(), "FIELD_ENCRYPT");
        assert_eq!(FieldOp::Decrypt.event_name(), "FIELD_DECRYPT");
    }

    /// Stands in for a sealing step whose cipher fails.
    struct FailingSeal;

    #[async_trait]
    impl Interceptor for FailingSeal {
        fn name(&self) -> &'static str {
            "failing-seal"
        }

        async fn before(
            &self,
            _session: &mut dyn Session,
            _ctx: &CallContext,
            query: &mut Query,
        ) -> Result<(), GuardError> {
            if query.operation.payloads_mut().is_empty() {
                return Ok(());
            }
            Err(seal_failed(&query.model, &CipherError::AeadFailure))
        }
    }

    #[tokio::test]
    async fn encryption_failure_aborts_the_write() {
        let chain: Arc<[Arc<dyn Interceptor>]> = Arc::from(vec![
            Arc::new(interceptor()) as Arc<dyn Interceptor>,
            Arc::new(FailingSeal),
        ]);
        let mut session = MockSession::new();
        session.expect_execute().never();

        let mut client = ScopedClient::new(&mut session, Scope::System, true, chain);
        let err = client
            .create("Patient", json!({"id": "p1", "ssn": "123-45-6789"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "encryption_error");
        assert!(err.to_string().contains("Patient"));
    }

    #[test]
    fn after_opens_returned_records() {
        let e = interceptor();
        let sealed = e.encrypt_record("ChatMessage", &json!({"message": "hi"})).unwrap();
        let query = Query::find_many("ChatMessage", Filter::all());
        let out = e.after(&ctx(), &query, QueryOutput::Records(vec![sealed]));
        assert_eq!(out, QueryOutput::Records(vec![json!({"message": "hi"})]));
    }
}
