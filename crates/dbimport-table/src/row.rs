use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Converts a JSON scalar. Arrays and objects have no scalar form.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Scalar::Null),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Scalar::Int(i)),
                None => n.as_f64().map(Scalar::Float),
            },
            Value::String(s) => Some(Scalar::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::from(*i),
            Scalar::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Scalar::Text(s) => Value::String(s.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Integral floats become integers; everything else is unchanged. Stores
    /// disagree on whether `12.0` comes back as a float or an integer.
    pub fn normalized(&self) -> Scalar {
        match self {
            Scalar::Float(f) => integral(*f).map_or(Scalar::Float(*f), Scalar::Int),
            other => other.clone(),
        }
    }

    /// SQL equality: `NULL` never equals anything, integers and floats
    /// compare numerically.
    pub fn sql_eq(&self, other: &Scalar) -> bool {
        match (self, other) {
            (Scalar::Null, _) | (_, Scalar::Null) => false,
            (Scalar::Int(a), Scalar::Float(b)) | (Scalar::Float(b), Scalar::Int(a)) => {
                (*a as f64) == *b
            }
            (a, b) => a == b,
        }
    }

    /// Interprets text the way a loosely typed source (CSV cell, path
    /// segment) would be read: integer, then float, then boolean, else text.
    pub fn infer(text: &str) -> Scalar {
        let trimmed = text.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return Scalar::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return Scalar::Float(f);
            }
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "true" => Scalar::Bool(true),
            "false" => Scalar::Bool(false),
            _ => Scalar::Text(text.to_string()),
        }
    }

    /// Coerces into the requested type.
    pub fn coerce(self, target: ScalarType) -> Result<Scalar, String> {
        match (target, self) {
            (_, Scalar::Null) => Ok(Scalar::Null),
            (ScalarType::Auto, Scalar::Text(s)) => Ok(Scalar::infer(&s)),
            (ScalarType::Auto, other) => Ok(other),
            (ScalarType::String, Scalar::Text(s)) => Ok(Scalar::Text(s)),
            (ScalarType::String, other) => Ok(Scalar::Text(other.to_string())),
            (ScalarType::Integer, Scalar::Int(i)) => Ok(Scalar::Int(i)),
            (ScalarType::Integer, Scalar::Float(f)) => integral(f)
                .map(Scalar::Int)
                .ok_or_else(|| format!("{f} is not an integer in range")),
            (ScalarType::Integer, Scalar::Text(s)) => s
                .trim()
                .parse::<i64>()
                .map(Scalar::Int)
                .map_err(|_| format!("'{s}' is not an integer")),
            (ScalarType::Float, Scalar::Int(i)) => Ok(Scalar::Float(i as f64)),
            (ScalarType::Float, Scalar::Float(f)) => Ok(Scalar::Float(f)),
            (ScalarType::Float, Scalar::Text(s)) => s
                .trim()
                .parse::<f64>()
                .map(Scalar::Float)
                .map_err(|_| format!("'{s}' is not a number")),
            (ScalarType::Boolean, Scalar::Bool(b)) => Ok(Scalar::Bool(b)),
            (ScalarType::Boolean, Scalar::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Scalar::Bool(true)),
                "false" | "0" | "no" => Ok(Scalar::Bool(false)),
                _ => Err(format!("'{s}' is not a boolean")),
            },
            (target, other) => Err(format!("cannot convert {other} to {target:?}")),
        }
    }
}

fn integral(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => Ok(()),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    #[default]
    Auto,
    String,
    Integer,
    Float,
    Boolean,
}

/// Column name to value. Rows are built once and never amended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, Scalar>);

impl Row {
    pub fn get(&self, column: &str) -> Option<&Scalar> {
        self.0.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Scalar)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Builds a row from a JSON object; nested values are kept as JSON text.
    pub fn from_json_object(value: &Value) -> Option<Row> {
        let object = value.as_object()?;
        Some(
            object
                .iter()
                .map(|(k, v)| {
                    let scalar = Scalar::from_json(v).unwrap_or_else(|| Scalar::Text(v.to_string()));
                    (k.clone(), scalar)
                })
                .collect(),
        )
    }

    /// Canonical text form, used to compare rows as multiset members.
    /// Numbers are normalized, so `12` and `12.0` are the same member.
    pub fn canonical(&self) -> String {
        let normalized = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), v.normalized().to_json()))
            .collect();
        Value::Object(normalized).to_string()
    }
}

impl FromIterator<(String, Scalar)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Scalar)>>(iter: I) -> Self {
        Row(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, Scalar>> for Row {
    fn from(value: BTreeMap<String, Scalar>) -> Self {
        Row(value)
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}
