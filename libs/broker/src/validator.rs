//! Parameter validation seam
//!
//! Actions may declare a params schema; when validation is enabled the
//! broker runs it through the configured validator before local dispatch.
//! The built-in validator understands a flat field-to-type map, which
//! covers required-field and primitive-type checking; richer schema
//! languages plug in through the trait.

use flock_types::BrokerError;
use serde_json::{json, Value};

pub trait Validator: Send + Sync + std::fmt::Debug {
    fn validate(&self, params: &Value, schema: &Value) -> Result<(), BrokerError>;
}

/// Built-in validator for schemas of the form
/// `{ "field": "string" | "number" | "boolean" | "object" | "array" | "any" }`.
/// A type suffixed with `?` marks the field optional.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParamValidator;

impl ParamValidator {
    pub fn new() -> Self {
        Self
    }
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Validator for ParamValidator {
    fn validate(&self, params: &Value, schema: &Value) -> Result<(), BrokerError> {
        let Some(fields) = schema.as_object() else {
            return Ok(());
        };

        let mut failures = Vec::new();
        for (field, expected) in fields {
            let expected = expected.as_str().unwrap_or("any");
            let (expected, optional) = match expected.strip_suffix('?') {
                Some(base) => (base, true),
                None => (expected, false),
            };

            match params.get(field) {
                None | Some(Value::Null) => {
                    if !optional {
                        failures.push(json!({
                            "field": field,
                            "expected": expected,
                            "actual": "missing",
                        }));
                    }
                }
                Some(actual) => {
                    if expected != "any" && type_of(actual) != expected {
                        failures.push(json!({
                            "field": field,
                            "expected": expected,
                            "actual": type_of(actual),
                        }));
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::validation(
                "invalid parameters",
                Some(Value::Array(failures)),
            ))
        }
    }
}
