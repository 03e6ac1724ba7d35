//! Compatibility between a producing spec and a consuming spec.
//!
//! A link is sound when every content valid under the producer's output spec
//! is also valid under the consumer's input spec.

use super::{FieldKind, FieldSpec, TokenSpec};

/// How a producer spec was found acceptable to a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// Same spec id.
    Exact,
    /// Consumer lists the producer id in `accepts`.
    Declared,
    /// Fields, types and bounds line up.
    Structural,
}

/// Decide whether `producer` output may feed a `consumer` input.
///
/// Returns the reason on mismatch.
pub fn check_compatibility(
    producer: &TokenSpec,
    consumer: &TokenSpec,
    structural: bool,
) -> Result<Compatibility, String> {
    if producer.spec_id == consumer.spec_id {
        return Ok(Compatibility::Exact);
    }
    if consumer.accepts.iter().any(|id| *id == producer.spec_id) {
        return Ok(Compatibility::Declared);
    }
    if !structural {
        return Err(format!(
            "'{}' does not accept '{}'",
            consumer.spec_id, producer.spec_id
        ));
    }

    for wanted in &consumer.fields {
        match producer.field(&wanted.name) {
            Some(offered) => field_fits(offered, wanted)?,
            None if wanted.required => {
                return Err(format!(
                    "'{}' requires field '{}' which '{}' does not declare",
                    consumer.spec_id, wanted.name, producer.spec_id
                ));
            }
            None => {}
        }
    }

    if !consumer.permissive {
        if producer.permissive {
            return Err(format!(
                "'{}' is permissive but '{}' rejects undeclared fields",
                producer.spec_id, consumer.spec_id
            ));
        }
        if let Some(extra) = producer.fields.iter().find(|f| !consumer.declares(&f.name)) {
            return Err(format!(
                "'{}' declares field '{}' unknown to '{}'",
                producer.spec_id, extra.name, consumer.spec_id
            ));
        }
    }

    Ok(Compatibility::Structural)
}

fn field_fits(offered: &FieldSpec, wanted: &FieldSpec) -> Result<(), String> {
    let name = &wanted.name;

    required_fits(offered, wanted)?;
    if wanted.kind == FieldKind::Json {
        return Ok(());
    }
    if offered.kind != wanted.kind {
        return Err(format!(
            "field '{name}' is {} but {} is expected",
            offered.kind, wanted.kind
        ));
    }

    if let Some(min) = wanted.min_value {
        if offered.min_value.map_or(true, |m| m < min) {
            return Err(format!("field '{name}' may fall below {min}"));
        }
    }
    if let Some(max) = wanted.max_value {
        if offered.max_value.map_or(true, |m| m > max) {
            return Err(format!("field '{name}' may exceed {max}"));
        }
    }
    if let Some(max_length) = wanted.max_length {
        if offered.max_length.map_or(true, |l| l > max_length) {
            return Err(format!("field '{name}' may exceed length {max_length}"));
        }
    }
    Ok(())
}

fn required_fits(offered: &FieldSpec, wanted: &FieldSpec) -> Result<(), String> {
    if wanted.required && !offered.required {
        return Err(format!("field '{}' is optional but required downstream", wanted.name));
    }
    Ok(())
}
