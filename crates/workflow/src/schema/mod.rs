//! Token specifications and the schema registry.
//!
//! A [`TokenSpec`] declares which fields a token may carry, their types and
//! their bounds. Specs are collected into a [`SchemaRegistry`], which is
//! checked for internal consistency when specs are registered and is treated
//! as an immutable snapshot once handed to the compiler.

pub mod compat;
pub mod validator;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use compat::{check_compatibility, Compatibility};
pub use validator::{ValidationError, Validator};

/// Declared type of a token field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    /// Any JSON number.
    Float,
    /// Integral JSON numbers only.
    Int,
    Bool,
    /// Any JSON value.
    Json,
}

impl FieldKind {
    /// Whether a JSON value has this kind.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Float => value.is_number(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::Json => true,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Float | Self::Int)
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Float => "float",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Json => "json",
        };
        f.write_str(name)
    }
}

/// Name of the JSON type of a value, for error messages.
pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn default_required() -> bool {
    true
}

/// One declared field of a token spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    /// Maximum length in characters, for string fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSpec {
    /// A required field with no bounds.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            min_value: None,
            max_value: None,
            max_length: None,
            description: None,
        }
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    #[must_use]
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self
    }

    #[must_use]
    pub fn with_min(mut self, min: f64) -> Self {
        self.min_value = Some(min);
        self
    }

    #[must_use]
    pub fn with_max(mut self, max: f64) -> Self {
        self.max_value = Some(max);
        self
    }

    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn check_bounds(&self) -> std::result::Result<(), String> {
        let has_numeric_bounds = self.min_value.is_some() || self.max_value.is_some();
        if has_numeric_bounds && !self.kind.is_numeric() {
            return Err(format!("min/max bounds on non-numeric {} field", self.kind));
        }
        if self.max_length.is_some() && self.kind != FieldKind::String {
            return Err(format!("max_length on non-string {} field", self.kind));
        }
        for bound in [self.min_value, self.max_value].into_iter().flatten() {
            if !bound.is_finite() {
                return Err(format!("bound {bound} is not finite"));
            }
        }
        match (self.min_value, self.max_value) {
            (Some(min), Some(max)) if min > max => Err(format!("min {min} exceeds max {max}")),
            _ => Ok(()),
        }
    }
}

/// Schema for the content of a token.
///
/// Fields are kept in declaration order; validation reports violations in
/// that order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSpec {
    pub spec_id: String,
    #[serde(default)]
    pub associated_topic: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// Accept content fields the spec does not declare.
    #[serde(default)]
    pub permissive: bool,
    /// Producer spec ids this spec explicitly accepts on an incoming link.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accepts: Vec<String>,
}

impl TokenSpec {
    pub fn new(spec_id: impl Into<String>, associated_topic: impl Into<String>) -> Self {
        Self {
            spec_id: spec_id.into(),
            associated_topic: associated_topic.into(),
            fields: Vec::new(),
            permissive: false,
            accepts: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn permissive(mut self) -> Self {
        self.permissive = true;
        self
    }

    #[must_use]
    pub fn accepting(mut self, producer_spec_id: impl Into<String>) -> Self {
        self.accepts.push(producer_spec_id.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }

    fn check(&self) -> std::result::Result<(), SchemaError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    spec_id: self.spec_id.clone(),
                    field: field.name.clone(),
                });
            }
            field
                .check_bounds()
                .map_err(|reason| SchemaError::InvalidBounds {
                    spec_id: self.spec_id.clone(),
                    field: field.name.clone(),
                    reason,
                })?;
        }
        Ok(())
    }
}

/// Errors raised while building a schema registry.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("token spec '{spec_id}' is registered twice")]
    DuplicateSpec { spec_id: String },

    #[error("token spec '{spec_id}' declares field '{field}' twice")]
    DuplicateField { spec_id: String, field: String },

    #[error("token spec '{spec_id}' field '{field}' has invalid bounds: {reason}")]
    InvalidBounds {
        spec_id: String,
        field: String,
        reason: String,
    },

    #[error("token spec with empty id")]
    EmptySpecId,

    #[error(transparent)]
    Document(#[from] tbcspn_core::Error),
}

/// Read-only lookup of token specs by id.
pub trait SchemaSource: Send + Sync {
    fn get_spec(&self, spec_id: &str) -> Option<Arc<TokenSpec>>;
}

/// On-disk shape of a schema definition document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDocument {
    #[serde(default)]
    pub specs: Vec<TokenSpec>,
}

/// Immutable set of token specs keyed by id.
///
/// Lookups hand out shared `Arc`s, so repeated lookups of one id return the
/// same value for the life of the registry.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    specs: HashMap<String, Arc<TokenSpec>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a collection of specs.
    pub fn from_specs(
        specs: impl IntoIterator<Item = TokenSpec>,
    ) -> std::result::Result<Self, SchemaError> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    /// Load a registry from a JSON, YAML or TOML document with a `specs` list.
    pub fn from_document(path: &Path) -> std::result::Result<Self, SchemaError> {
        let document: SchemaDocument = tbcspn_core::load_document(path)?;
        let registry = Self::from_specs(document.specs)?;
        tracing::info!(path = %path.display(), specs = registry.len(), "Loaded schema registry");
        Ok(registry)
    }

    /// Add a spec. Ids must be unique and each spec internally consistent.
    pub fn register(&mut self, spec: TokenSpec) -> std::result::Result<(), SchemaError> {
        if spec.spec_id.is_empty() {
            return Err(SchemaError::EmptySpecId);
        }
        if self.specs.contains_key(&spec.spec_id) {
            return Err(SchemaError::DuplicateSpec {
                spec_id: spec.spec_id,
            });
        }
        spec.check()?;
        self.specs.insert(spec.spec_id.clone(), Arc::new(spec));
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_spec(mut self, spec: TokenSpec) -> std::result::Result<Self, SchemaError> {
        self.register(spec)?;
        Ok(self)
    }

    pub fn get(&self, spec_id: &str) -> Option<Arc<TokenSpec>> {
        self.specs.get(spec_id).cloned()
    }

    pub fn contains(&self, spec_id: &str) -> bool {
        self.specs.contains_key(spec_id)
    }

    /// Registered spec ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.specs.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl SchemaSource for SchemaRegistry {
    fn get_spec(&self, spec_id: &str) -> Option<Arc<TokenSpec>> {
        self.get(spec_id)
    }
}
