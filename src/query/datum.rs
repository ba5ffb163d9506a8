//! Datum - the opaque, totally ordered value rows and grouping keys are made of.
//!
//! Ordering is structural: values of different types order by type name
//! (`ARRAY < BOOL < NULL < NUMBER < OBJECT < STRING`), values of the same type
//! order by content. `Hash` agrees with `Eq`, so a `Datum` can key both ordered
//! and hashed maps.

use super::error::QueryError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Datum>),
    Object(BTreeMap<String, Datum>),
}

/// `-0.0` and `0.0` are the same number.
#[inline]
fn normalize(n: f64) -> f64 {
    if n == 0.0 {
        0.0
    } else {
        n
    }
}

impl Datum {
    /// Checked number constructor; non-finite values are rejected.
    pub fn number(n: f64) -> Result<Datum, QueryError> {
        if n.is_finite() {
            Ok(Datum::Number(n))
        } else {
            Err(QueryError::generic(format!("Non-finite number: {}", n)))
        }
    }

    pub fn object<K, I>(fields: I) -> Datum
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Datum)>,
    {
        Datum::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Datum::Array(_) => "ARRAY",
            Datum::Bool(_) => "BOOL",
            Datum::Null => "NULL",
            Datum::Number(_) => "NUMBER",
            Datum::Object(_) => "OBJECT",
            Datum::String(_) => "STRING",
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Datum::Array(_) => 0,
            Datum::Bool(_) => 1,
            Datum::Null => 2,
            Datum::Number(_) => 3,
            Datum::Object(_) => 4,
            Datum::String(_) => 5,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// `null` and `false` are falsy, everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Datum::Null | Datum::Bool(false))
    }

    pub fn as_number(&self) -> Result<f64, QueryError> {
        match self {
            Datum::Number(n) => Ok(*n),
            other => Err(QueryError::type_mismatch("NUMBER", other.type_name())),
        }
    }

    pub fn as_str(&self) -> Result<&str, QueryError> {
        match self {
            Datum::String(s) => Ok(s),
            other => Err(QueryError::type_mismatch("STRING", other.type_name())),
        }
    }

    pub fn as_array(&self) -> Result<&[Datum], QueryError> {
        match self {
            Datum::Array(items) => Ok(items),
            other => Err(QueryError::type_mismatch("ARRAY", other.type_name())),
        }
    }

    pub fn into_array(self) -> Result<Vec<Datum>, QueryError> {
        match self {
            Datum::Array(items) => Ok(items),
            other => Err(QueryError::generic(format!(
                "Cannot convert {} to SEQUENCE",
                other.type_name()
            ))),
        }
    }

    pub fn get_field(&self, name: &str) -> Result<&Datum, QueryError> {
        match self {
            Datum::Object(fields) => fields.get(name).ok_or_else(|| {
                QueryError::non_existence(format!("No attribute `{}` in object:\n{}", name, self))
            }),
            other => Err(QueryError::type_mismatch("OBJECT", other.type_name())),
        }
    }

    /// Rough in-memory footprint, used for batch sizing.
    pub fn estimated_size(&self) -> usize {
        const HEADER: usize = 8;
        match self {
            Datum::Null | Datum::Bool(_) => HEADER,
            Datum::Number(_) => HEADER + 8,
            Datum::String(s) => HEADER + s.len(),
            Datum::Array(items) => HEADER + items.iter().map(Datum::estimated_size).sum::<usize>(),
            Datum::Object(fields) => {
                HEADER
                    + fields
                        .iter()
                        .map(|(k, v)| k.len() + v.estimated_size())
                        .sum::<usize>()
            }
        }
    }

    /// Translate from the JSON wire representation.
    pub fn from_json(value: serde_json::Value) -> Result<Datum, QueryError> {
        use serde_json::Value;
        Ok(match value {
            Value::Null => Datum::Null,
            Value::Bool(b) => Datum::Bool(b),
            Value::Number(n) => {
                let f = n
                    .as_f64()
                    .ok_or_else(|| QueryError::generic(format!("Unrepresentable number: {}", n)))?;
                Datum::number(f)?
            }
            Value::String(s) => Datum::String(s),
            Value::Array(items) => Datum::Array(
                items
                    .into_iter()
                    .map(Datum::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(fields) => Datum::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| Datum::from_json(v).map(|d| (k, d)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// Translate to the JSON wire representation.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Datum::Null => Value::Null,
            Datum::Bool(b) => Value::Bool(*b),
            Datum::Number(n)
                if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64 =>
            {
                Value::Number(serde_json::Number::from(*n as i64))
            }
            Datum::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Datum::String(s) => Value::String(s.clone()),
            Datum::Array(items) => Value::Array(items.iter().map(Datum::to_json).collect()),
            Datum::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Number(a), Datum::Number(b)) => normalize(*a).total_cmp(&normalize(*b)),
            (Datum::String(a), Datum::String(b)) => a.cmp(b),
            (Datum::Array(a), Datum::Array(b)) => a.cmp(b),
            (Datum::Object(a), Datum::Object(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            Datum::Null => {}
            Datum::Bool(b) => b.hash(state),
            Datum::Number(n) => normalize(*n).to_bits().hash(state),
            Datum::String(s) => s.hash(state),
            Datum::Array(items) => items.hash(state),
            Datum::Object(fields) => fields.hash(state),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<bool> for Datum {
    fn from(b: bool) -> Self {
        Datum::Bool(b)
    }
}

impl From<i64> for Datum {
    fn from(n: i64) -> Self {
        Datum::Number(n as f64)
    }
}

impl From<i32> for Datum {
    fn from(n: i32) -> Self {
        Datum::Number(f64::from(n))
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::String(s.to_string())
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum::String(s)
    }
}

impl From<Vec<Datum>> for Datum {
    fn from(items: Vec<Datum>) -> Self {
        Datum::Array(items)
    }
}
