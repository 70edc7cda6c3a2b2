//! Which fields of which entity types are treated as sensitive.
//!
//! # Responsibilities
//!
//! - Hold the static entity-type → field-list table plus the global list that
//!   applies to every entity type.
//! - Load it once at startup, from the built-in defaults or a YAML file.
//! - Hand out lock-free snapshots to the encryption interceptor and the
//!   backfill migrator.
//!
//! # Module invariants
//!
//! - **Immutable tables.** A [`FieldTable`] is never mutated after
//!   construction; [`FieldRegistry::replace`] swaps in a whole new table.
//! - **The tenant field is never sensitive.** Tables naming it are rejected.

pub mod registry;

pub use registry::FieldRegistry;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::tenant::TENANT_FIELD;

/// Errors raised while building a [`FieldTable`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldTableError {
    /// The same entity type appears twice.
    #[error("entity type listed twice: {0}")]
    DuplicateModel(String),

    /// An entity type or field name is blank.
    #[error("blank entity type or field name")]
    BlankName,

    /// The tenant field was listed as sensitive.
    #[error("{TENANT_FIELD} can never be an encrypted field (listed for {0})")]
    TenantField(String),
}

/// Sensitive fields of one entity type, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFields {
    /// Entity type name, e.g. `"Patient"`.
    pub model: String,
    /// Field names to encrypt.
    #[serde(default)]
    pub fields: Vec<String>,
}

/// On-disk shape of the field table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldTableSpec {
    /// Per entity type lists.
    #[serde(default)]
    pub models: Vec<ModelFields>,
    /// Fields encrypted on every entity type.
    #[serde(default)]
    pub global: Vec<String>,
}

/// Immutable, validated field table.
#[derive(Debug, Clone)]
pub struct FieldTable {
    models: Vec<ModelFields>,
    global: Arc<[String]>,
    merged: HashMap<String, Arc<[String]>>,
}

impl FieldTable {
    /// Validate `spec` and pre-compute the merged per-model lists.
    ///
    /// # Errors
    ///
    /// See [`FieldTableError`].
    pub fn new(spec: FieldTableSpec) -> Result<Self, FieldTableError> {
        for name in &spec.global {
            check_field("_global", name)?;
        }
        let global: Arc<[String]> = dedup(spec.global.iter()).into();

        let mut merged = HashMap::new();
        for entry in &spec.models {
            if entry.model.trim().is_empty() {
                return Err(FieldTableError::BlankName);
            }
            for name in &entry.fields {
                check_field(&entry.model, name)?;
            }
            let list: Arc<[String]> = dedup(entry.fields.iter().chain(global.iter())).into();
            if merged.insert(entry.model.clone(), list).is_some() {
                return Err(FieldTableError::DuplicateModel(entry.model.clone()));
            }
        }

        Ok(Self {
            models: spec.models,
            global,
            merged,
        })
    }

    /// Built-in table used when no file is configured.
    pub fn builtin() -> Self {
        // `builtin_spec` always validates (see `builtin_spec_is_valid`).
        Self::new(builtin_spec()).unwrap_or_else(|_| Self::empty())
    }

    /// A table with no sensitive fields at all.
    pub fn empty() -> Self {
        Self {
            models: Vec::new(),
            global: Arc::from(Vec::new()),
            merged: HashMap::new(),
        }
    }

    /// Parse and validate a YAML table.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid YAML or fails validation.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let spec: FieldTableSpec =
            serde_yaml::from_str(text).context("encrypted field table is not valid YAML")?;
        Self::new(spec).context("encrypted field table failed validation")
    }

    /// Load the table named by `cfg.encrypted_fields_path`, or the built-in one.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured file cannot be read or parsed.
    pub fn load(cfg: &Config) -> Result<Self> {
        match &cfg.encrypted_fields_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read encrypted field table {path}"))?;
                Self::from_yaml(&text)
            }
            None => Ok(Self::builtin()),
        }
    }

    /// Fields to treat as sensitive for `model`: its own list followed by the
    /// global list, without duplicates. Unknown models get the global list.
    pub fn fields_for(&self, model: &str) -> &[String] {
        self.merged
            .get(model)
            .map(|list| &list[..])
            .unwrap_or(&self.global[..])
    }

    /// Configured entity types, in declaration order.
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.model.as_str())
    }

    /// Returns `true` if `model` has its own entry.
    pub fn contains_model(&self, model: &str) -> bool {
        self.merged.contains_key(model)
    }

    /// The global list.
    pub fn global(&self) -> &[String] {
        &self.global
    }
}

/// The built-in entity type and global lists.
fn builtin_spec() -> FieldTableSpec {
    let entry = |model: &str, fields: &[&str]| ModelFields {
        model: model.into(),
        fields: fields.iter().map(|f| (*f).to_owned()).collect(),
    };
    FieldTableSpec {
        models: vec![
            entry("User", &["phone"]),
            entry("Patient", &["emergencyContact"]),
            entry("Caregiver", &["homeAddress", "phone", "email"]),
            entry(
                "PatientHome",
                &[
                    "address",
                    "addressLine2",
                    "city",
                    "state",
                    "zipCode",
                    "accessInstructions",
                    "gateCode",
                    "emergencyContact",
                    "emergencyPhone",
                ],
            ),
            entry("MileageEntry", &["startAddress", "endAddress"]),
            entry("ClinicalNote", &["content"]),
            entry("Encounter", &[]),
            entry("Appointment", &["notes"]),
            entry("Visit", &[]),
            entry("ChatMessage", &["message"]),
            entry("Vendor", &["address"]),
        ],
        global: [
            "ssn",
            "socialSecurityNumber",
            "taxId",
            "ein",
            "driverLicense",
            "passportNumber",
            "bankAccountNumber",
            "routingNumber",
            "creditCardNumber",
        ]
        .iter()
        .map(|f| (*f).to_owned())
        .collect(),
    }
}

fn check_field(model: &str, name: &str) -> Result<(), FieldTableError> {
    if name.trim().is_empty() {
        return Err(FieldTableError::BlankName);
    }
    if name == TENANT_FIELD {
        return Err(FieldTableError::TenantField(model.to_owned()));
    }
    Ok(())
}

fn dedup<'a>(names: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .filter(|n| seen.insert(n.as_str()))
        .cloned()
        .collect()
}
