//! Type coercion from heterogeneous raw payloads into registry types.
//!
//! Upstream payloads arrive with numerics as text, floats where integers are
//! declared, padded strings, and nulls. One tagged conversion table turns a
//! `RawValue` into the `SemanticType` the registry declares. All conversions
//! are pure; there are no retry semantics here.

use chrono::NaiveDate;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::schema::{FieldDef, SemanticType};

/// A raw entity row keyed by canonical field name, values untyped.
pub type RawRow = BTreeMap<String, RawValue>;

/// A value as it arrived from a source, before coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl RawValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => RawValue::Null,
            Value::Bool(b) => RawValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    RawValue::Integer(i)
                } else {
                    RawValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => RawValue::Text(s.clone()),
            other => RawValue::Text(other.to_string()),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            RawValue::Null => "null",
            RawValue::Integer(_) => "integer",
            RawValue::Float(_) => "float",
            RawValue::Text(_) => "text",
            RawValue::Bool(_) => "bool",
        }
    }

    fn render(&self) -> String {
        match self {
            RawValue::Null => "<null>".to_string(),
            RawValue::Integer(i) => i.to_string(),
            RawValue::Float(f) => f.to_string(),
            RawValue::Text(s) => s.clone(),
            RawValue::Bool(b) => b.to_string(),
        }
    }
}

/// A value after coercion to its declared semantic type.
#[derive(Debug, Clone, PartialEq)]
pub enum CoercedValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl CoercedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CoercedValue::Null)
    }

    pub fn require_text(self, field: &str) -> Result<String, CoercionError> {
        match self {
            CoercedValue::Text(s) => Ok(s),
            other => Err(shape_error(field, SemanticType::Text, &other)),
        }
    }

    pub fn optional_text(self, field: &str) -> Result<Option<String>, CoercionError> {
        match self {
            CoercedValue::Null => Ok(None),
            CoercedValue::Text(s) => Ok(Some(s)),
            other => Err(shape_error(field, SemanticType::Text, &other)),
        }
    }

    pub fn require_f64(self, field: &str) -> Result<f64, CoercionError> {
        match self {
            CoercedValue::Float(f) => Ok(f),
            CoercedValue::Integer(i) => Ok(i as f64),
            other => Err(shape_error(field, SemanticType::Float, &other)),
        }
    }

    pub fn optional_f64(self, field: &str) -> Result<Option<f64>, CoercionError> {
        match self {
            CoercedValue::Null => Ok(None),
            other => other.require_f64(field).map(Some),
        }
    }
}

fn shape_error(field: &str, expected: SemanticType, got: &CoercedValue) -> CoercionError {
    CoercionError {
        field: field.to_string(),
        raw: format!("{got:?}"),
        expected,
        reason: "coerced value has unexpected shape".to_string(),
    }
}

/// Fatal for required fields; the caller must never default past one.
#[derive(Debug, Clone)]
pub struct CoercionError {
    pub field: String,
    pub raw: String,
    pub expected: SemanticType,
    pub reason: String,
}

impl fmt::Display for CoercionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot coerce field '{}' value '{}' to {:?}: {}",
            self.field, self.raw, self.expected, self.reason
        )
    }
}

impl std::error::Error for CoercionError {}

/// Coerce a raw value against its field definition.
///
/// Null maps to `CoercedValue::Null` only for nullable fields; for required
/// fields it is a `CoercionError`.
pub fn coerce_field(field: &FieldDef, raw: &RawValue) -> Result<CoercedValue, CoercionError> {
    if let RawValue::Null = raw {
        if field.nullable {
            return Ok(CoercedValue::Null);
        }
        return Err(CoercionError {
            field: field.name.to_string(),
            raw: "<null>".to_string(),
            expected: field.semantic,
            reason: "null in required field".to_string(),
        });
    }
    convert(field.semantic, raw).map_err(|reason| CoercionError {
        field: field.name.to_string(),
        raw: raw.render(),
        expected: field.semantic,
        reason,
    })
}

/// The conversion table: (target type, source value) -> coerced value.
fn convert(target: SemanticType, raw: &RawValue) -> Result<CoercedValue, String> {
    match (target, raw) {
        (SemanticType::Integer, RawValue::Integer(i)) => Ok(CoercedValue::Integer(*i)),
        (SemanticType::Integer, RawValue::Float(f)) => {
            if f.is_finite() {
                Ok(CoercedValue::Integer(f.trunc() as i64))
            } else {
                Err("non-finite float".to_string())
            }
        }
        (SemanticType::Integer, RawValue::Text(s)) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Ok(CoercedValue::Integer(i));
            }
            match trimmed.parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(CoercedValue::Integer(f.trunc() as i64)),
                _ => Err("not parseable as integer".to_string()),
            }
        }
        (SemanticType::Float, RawValue::Integer(i)) => Ok(CoercedValue::Float(*i as f64)),
        (SemanticType::Float, RawValue::Float(f)) => {
            if f.is_finite() {
                Ok(CoercedValue::Float(*f))
            } else {
                Err("non-finite float".to_string())
            }
        }
        (SemanticType::Float, RawValue::Text(s)) => match s.trim().parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(CoercedValue::Float(f)),
            _ => Err("not parseable as float".to_string()),
        },
        (SemanticType::Text, RawValue::Text(s)) => Ok(CoercedValue::Text(s.trim().to_string())),
        (SemanticType::Text, RawValue::Integer(i)) => Ok(CoercedValue::Text(i.to_string())),
        (SemanticType::Text, RawValue::Float(f)) => Ok(CoercedValue::Text(f.to_string())),
        (SemanticType::Text, RawValue::Bool(b)) => Ok(CoercedValue::Text(b.to_string())),
        (SemanticType::Date, RawValue::Text(s)) => {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(CoercedValue::Date)
                .map_err(|e| format!("not a YYYY-MM-DD date: {e}"))
        }
        (_, other) => Err(format!("no conversion from {}", other.type_name())),
    }
}
