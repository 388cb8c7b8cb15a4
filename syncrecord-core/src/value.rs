//! Values
//!
//! Records travel through the engine as JSON objects ([`Record`]). Query
//! conditions compare fields against [`Scalar`] values, or lists of them for
//! `IN` style operators ([`ConditionValue`]).
//!
//! Scalars have a canonical text encoding used by query fingerprints, so two
//! equal values always encode identically (`Int(1)` and `Float(1.0)` are
//! different values and encode differently).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row as delivered by the backend.
pub type Record = serde_json::Map<String, Value>;

/// A single comparable value.
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
    /// Canonical encoding: a type tag followed by the value.
    pub fn canonical(&self) -> String {
        match self {
            Scalar::Null => "n:".to_string(),
            Scalar::Bool(b) => format!("b:{b}"),
            Scalar::Int(i) => format!("i:{i}"),
            // `{:?}` keeps a trailing `.0` so floats never collide with ints.
            Scalar::Float(x) => format!("f:{x:?}"),
            Scalar::Text(s) => format!("s:{s:?}"),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Convert to a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Int(i) => Value::from(*i),
            Scalar::Float(x) => serde_json::Number::from_f64(*x)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Scalar::Text(s) => Value::String(s.clone()),
        }
    }

    /// Convert from a JSON value. Arrays and objects have no scalar form.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Scalar::Null),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Scalar::Int)
                .or_else(|| n.as_f64().map(Scalar::Float)),
            Value::String(s) => Some(Scalar::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("null"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// Total order over JSON values used for sorting rows.
///
/// Nulls sort first, then booleans, numbers, strings, and finally arrays and
/// objects (compared by their serialized form).
pub fn compare_json(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

macro_rules! scalar_from {
    ($($ty:ty => $variant:ident as $cast:ty),* $(,)?) => {
        $(
            impl From<$ty> for Scalar {
                fn from(value: $ty) -> Self {
                    Scalar::$variant(value as $cast)
                }
            }
        )*
    };
}

scalar_from! {
    i64 => Int as i64,
    i32 => Int as i64,
    u32 => Int as i64,
    f64 => Float as f64,
    f32 => Float as f64,
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
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

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Scalar::Null)
    }
}

/// The right-hand side of a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    One(Scalar),
    Many(Vec<Scalar>),
}

impl ConditionValue {
    pub fn null() -> Self {
        ConditionValue::One(Scalar::Null)
    }

    pub fn is_list(&self) -> bool {
        matches!(self, ConditionValue::Many(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ConditionValue::One(Scalar::Null))
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            ConditionValue::One(s) => Some(s),
            ConditionValue::Many(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Scalar]> {
        match self {
            ConditionValue::One(_) => None,
            ConditionValue::Many(items) => Some(items),
        }
    }

    /// Canonical encoding. Lists are sorted and deduplicated, since `IN`
    /// membership does not depend on element order.
    pub fn canonical(&self) -> String {
        match self {
            ConditionValue::One(s) => s.canonical(),
            ConditionValue::Many(items) => {
                let mut encoded: Vec<String> = items.iter().map(Scalar::canonical).collect();
                encoded.sort();
                encoded.dedup();
                format!("[{}]", encoded.join(","))
            }
        }
    }

    /// A copy with list elements in canonical order.
    pub fn normalized(&self) -> Self {
        match self {
            ConditionValue::One(_) => self.clone(),
            ConditionValue::Many(items) => {
                let mut keyed: Vec<(String, Scalar)> =
                    items.iter().map(|s| (s.canonical(), s.clone())).collect();
                keyed.sort_by(|a, b| a.0.cmp(&b.0));
                keyed.dedup_by(|a, b| a.0 == b.0);
                ConditionValue::Many(keyed.into_iter().map(|(_, s)| s).collect())
            }
        }
    }
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::One(s) => write!(f, "{s}"),
            ConditionValue::Many(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

macro_rules! condition_from_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ConditionValue {
                fn from(value: $ty) -> Self {
                    ConditionValue::One(value.into())
                }
            }
        )*
    };
}

condition_from_scalar!(Scalar, i64, i32, u32, f64, f32, bool, &str, String);

impl<T: Into<Scalar>> From<Option<T>> for ConditionValue {
    fn from(value: Option<T>) -> Self {
        ConditionValue::One(value.into())
    }
}

impl<T: Into<Scalar>> From<Vec<T>> for ConditionValue {
    fn from(values: Vec<T>) -> Self {
        ConditionValue::Many(values.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_encoding_distinguishes_types() {
        assert_ne!(Scalar::Int(1).canonical(), Scalar::Float(1.0).canonical());
        assert_ne!(Scalar::Int(1).canonical(), Scalar::Text("1".into()).canonical());
        assert_eq!(Scalar::from("a").canonical(), "s:\"a\"");
        assert_eq!(Scalar::from(None::<i64>), Scalar::Null);
    }

    #[test]
    fn list_canonical_ignores_order_and_duplicates() {
        let a = ConditionValue::from(vec![3, 1, 2, 1]);
        let b = ConditionValue::from(vec![1, 2, 3]);
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.normalized(), b);
    }

    #[test]
    fn json_round_trip_for_scalars() {
        for value in [json!(null), json!(true), json!(7), json!(2.5), json!("x")] {
            let scalar = Scalar::from_json(&value).unwrap();
            assert_eq!(scalar.to_json(), value);
        }
        assert!(Scalar::from_json(&json!([1])).is_none());
    }

    #[test]
    fn compare_json_orders_mixed_values() {
        let mut values = vec![json!("b"), json!(2), json!(null), json!(1.5), json!("a"), json!(true)];
        values.sort_by(compare_json);
        assert_eq!(
            values,
            vec![json!(null), json!(true), json!(1.5), json!(2), json!("a"), json!("b")]
        );
    }
}
