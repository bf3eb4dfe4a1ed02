//! Dynamically typed values flowing through rule expressions, contexts and
//! custom properties.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

/// A tagged value as it appears on the evaluation stack.
///
/// `Undefined` is distinct from `Null`: `Undefined` means "no such property",
/// `Null` means "property exists, value absent".
#[derive(Debug, Clone, Default)]
pub enum DynamicValue {
    Int(i64),
    Double(f64),
    Boolean(bool),
    String(String),
    DateTime(DateTime<Utc>),
    List(Vec<DynamicValue>),
    Map(IndexMap<String, DynamicValue>),
    Null,
    #[default]
    Undefined,
}

impl DynamicValue {
    pub fn is_int(&self) -> bool {
        matches!(self, DynamicValue::Int(_))
    }

    pub fn is_double(&self) -> bool {
        matches!(self, DynamicValue::Double(_))
    }

    pub fn is_numeric(&self) -> bool {
        self.is_int() || self.is_double()
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, DynamicValue::Boolean(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, DynamicValue::String(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, DynamicValue::List(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self, DynamicValue::Map(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DynamicValue::Null)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, DynamicValue::Undefined)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            DynamicValue::Int(value) => Some(*value),
            DynamicValue::Double(value) => Some(*value as i64),
            _ => None,
        }
    }

    /// Numeric view: ints widen to doubles.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            DynamicValue::Int(value) => Some(*value as f64),
            DynamicValue::Double(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            DynamicValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            DynamicValue::DateTime(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DynamicValue]> {
        match self {
            DynamicValue::List(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, DynamicValue>> {
        match self {
            DynamicValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Maps a JSON document into a dynamic value. Objects keep their key
    /// order, which the bucketing operator relies on.
    pub fn from_json(value: &serde_json::Value) -> DynamicValue {
        match value {
            serde_json::Value::Null => DynamicValue::Null,
            serde_json::Value::Bool(b) => DynamicValue::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DynamicValue::Int(i)
                } else {
                    DynamicValue::Double(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => DynamicValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                DynamicValue::List(items.iter().map(DynamicValue::from_json).collect())
            }
            serde_json::Value::Object(entries) => DynamicValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), DynamicValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Equality rules of the rule language: numerics compare as doubles within a
/// single-precision epsilon, strings byte-equal, `Null == Null`,
/// `Undefined == Undefined`; any other combination is unequal.
impl PartialEq for DynamicValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DynamicValue::Boolean(a), DynamicValue::Boolean(b)) => a == b,
            (DynamicValue::String(a), DynamicValue::String(b)) => a == b,
            (DynamicValue::Null, DynamicValue::Null) => true,
            (DynamicValue::Undefined, DynamicValue::Undefined) => true,
            (a, b) if a.is_numeric() && b.is_numeric() => {
                let (a, b) = (a.as_number().unwrap(), b.as_number().unwrap());
                (a - b).abs() < f32::EPSILON as f64
            }
            _ => false,
        }
    }
}

impl From<i64> for DynamicValue {
    fn from(value: i64) -> Self {
        DynamicValue::Int(value)
    }
}

impl From<f64> for DynamicValue {
    fn from(value: f64) -> Self {
        DynamicValue::Double(value)
    }
}

impl From<bool> for DynamicValue {
    fn from(value: bool) -> Self {
        DynamicValue::Boolean(value)
    }
}

impl From<&str> for DynamicValue {
    fn from(value: &str) -> Self {
        DynamicValue::String(value.to_string())
    }
}

impl From<String> for DynamicValue {
    fn from(value: String) -> Self {
        DynamicValue::String(value)
    }
}

impl From<DateTime<Utc>> for DynamicValue {
    fn from(value: DateTime<Utc>) -> Self {
        DynamicValue::DateTime(value)
    }
}

impl From<Vec<DynamicValue>> for DynamicValue {
    fn from(values: Vec<DynamicValue>) -> Self {
        DynamicValue::List(values)
    }
}

impl From<IndexMap<String, DynamicValue>> for DynamicValue {
    fn from(map: IndexMap<String, DynamicValue>) -> Self {
        DynamicValue::Map(map)
    }
}
