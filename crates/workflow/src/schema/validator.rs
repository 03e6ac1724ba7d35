//! Content validation against token specs.

use serde_json::Value;
use thiserror::Error;

use super::{json_type_name, FieldKind, FieldSpec, SchemaSource, TokenSpec};
use crate::token::Content;

/// A single schema violation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("unknown token spec '{spec_id}'")]
    UnknownSpec { spec_id: String },

    #[error("{spec_id}: missing required field '{field}'")]
    MissingField { spec_id: String, field: String },

    #[error("{spec_id}: field '{field}' must be {expected} (got {found})")]
    TypeMismatch {
        spec_id: String,
        field: String,
        expected: FieldKind,
        found: String,
    },

    #[error("{spec_id}: field '{field}' value {value} outside [{}, {}]", fmt_bound(.min), fmt_bound(.max))]
    OutOfBounds {
        spec_id: String,
        field: String,
        value: f64,
        min: Option<f64>,
        max: Option<f64>,
    },

    #[error("{spec_id}: field '{field}' length {length} exceeds {max_length}")]
    TooLong {
        spec_id: String,
        field: String,
        length: usize,
        max_length: usize,
    },

    #[error("{spec_id}: undeclared field '{field}'")]
    UndeclaredField { spec_id: String, field: String },
}

fn fmt_bound(bound: &Option<f64>) -> String {
    bound.map_or_else(|| "-".to_string(), |b| b.to_string())
}

impl ValidationError {
    /// The field the violation concerns, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::UnknownSpec { .. } => None,
            Self::MissingField { field, .. }
            | Self::TypeMismatch { field, .. }
            | Self::OutOfBounds { field, .. }
            | Self::TooLong { field, .. }
            | Self::UndeclaredField { field, .. } => Some(field),
        }
    }
}

/// Validates content against specs looked up from a schema source.
pub struct Validator<'a> {
    schemas: &'a dyn SchemaSource,
}

impl<'a> Validator<'a> {
    pub fn new(schemas: &'a dyn SchemaSource) -> Self {
        Self { schemas }
    }

    /// Fail-fast validation: the first violation in field declaration order.
    pub fn validate(&self, content: &Content, spec_id: &str) -> Result<(), ValidationError> {
        let spec = self
            .schemas
            .get_spec(spec_id)
            .ok_or_else(|| ValidationError::UnknownSpec {
                spec_id: spec_id.to_string(),
            })?;
        check(content, &spec)
    }

    /// Aggregate validation: every violation, in the same order.
    pub fn validate_all(
        &self,
        content: &Content,
        spec_id: &str,
    ) -> Result<(), Vec<ValidationError>> {
        let spec = self.schemas.get_spec(spec_id).ok_or_else(|| {
            vec![ValidationError::UnknownSpec {
                spec_id: spec_id.to_string(),
            }]
        })?;
        let errors = check_all(content, &spec);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Check content against a spec, stopping at the first violation.
pub fn check(content: &Content, spec: &TokenSpec) -> Result<(), ValidationError> {
    match violations(content, spec).next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Check content against a spec, collecting every violation.
pub fn check_all(content: &Content, spec: &TokenSpec) -> Vec<ValidationError> {
    violations(content, spec).collect()
}

/// Declared fields first, in declaration order, then undeclared fields for
/// strict specs. A `null` value counts as absent.
fn violations<'s>(
    content: &'s Content,
    spec: &'s TokenSpec,
) -> impl Iterator<Item = ValidationError> + 's {
    let declared = spec
        .fields
        .iter()
        .filter_map(move |field| match content.get(&field.name) {
            None | Some(Value::Null) if field.required => Some(ValidationError::MissingField {
                spec_id: spec.spec_id.clone(),
                field: field.name.clone(),
            }),
            None | Some(Value::Null) => None,
            Some(value) => field_violation(&spec.spec_id, field, value),
        });

    let undeclared = content
        .keys()
        .filter(move |name| !spec.permissive && !spec.declares(name))
        .map(move |name| ValidationError::UndeclaredField {
            spec_id: spec.spec_id.clone(),
            field: name.clone(),
        });

    declared.chain(undeclared)
}

fn field_violation(spec_id: &str, field: &FieldSpec, value: &Value) -> Option<ValidationError> {
    if !field.kind.matches(value) {
        return Some(ValidationError::TypeMismatch {
            spec_id: spec_id.to_string(),
            field: field.name.clone(),
            expected: field.kind,
            found: json_type_name(value).to_string(),
        });
    }

    if let Some(number) = value.as_f64().filter(|_| field.kind.is_numeric()) {
        let below = field.min_value.is_some_and(|min| number < min);
        let above = field.max_value.is_some_and(|max| number > max);
        if below || above {
            return Some(ValidationError::OutOfBounds {
                spec_id: spec_id.to_string(),
                field: field.name.clone(),
                value: number,
                min: field.min_value,
                max: field.max_value,
            });
        }
    }

    if let (Some(text), Some(max_length)) = (value.as_str(), field.max_length) {
        let length = text.chars().count();
        if length > max_length {
            return Some(ValidationError::TooLong {
                spec_id: spec_id.to_string(),
                field: field.name.clone(),
                length,
                max_length,
            });
        }
    }

    None
}
