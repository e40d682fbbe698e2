//! SQL values exchanged with the store, and coercion into Rust types.
//!
//! Statement arguments are sent exactly as given. Row values are decoded into
//! the same [`Value`] enum; [`FromValue`] performs the lossless widenings the
//! JSON wire format forces on us (integral floats into integers, epoch numbers
//! and formatted strings into timestamps).

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Serialize, Serializer};

/// A single SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    /// Sent on the wire as a base64 string.
    Blob(Vec<u8>),
    /// Sent on the wire as an RFC 3339 string.
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bool(_) => "bool",
            Value::Blob(_) => "blob",
            Value::Timestamp(_) => "timestamp",
        }
    }

    pub(crate) fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s),
            other => Value::Text(other.to_string()),
        }
    }

    /// Applies the column's declared type: date/time columns become
    /// timestamps, base64 text in blob columns becomes bytes. Values that do
    /// not convert are returned unchanged.
    pub(crate) fn with_declared_type(self, declared: &str) -> Self {
        let declared = declared.to_ascii_lowercase();
        if is_time_type(&declared) {
            return match to_timestamp(&self) {
                Some(ts) => Value::Timestamp(ts),
                None => self,
            };
        }
        if declared == "blob" {
            if let Value::Text(text) = &self {
                if let Ok(bytes) = BASE64.decode(text) {
                    return Value::Blob(bytes);
                }
            }
        }
        self
    }
}

fn is_time_type(declared: &str) -> bool {
    declared.contains("date") || declared.contains("timestamp")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Blob(bytes) => write!(f, "X'{}'", hex(bytes)),
            Value::Timestamp(ts) => write!(f, "'{}'", ts.to_rfc3339()),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Blob(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
            Value::Timestamp(ts) => serializer.serialize_str(&ts.to_rfc3339()),
        }
    }
}

macro_rules! value_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Integer(i64::from(v))
            }
        })*
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Conversion from a decoded [`Value`] into a Rust type.
///
/// The error string describes the mismatch; callers wrap it with the column
/// it came from.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, String>;
}

fn mismatch(value: &Value, target: &str) -> String {
    format!("cannot convert {} value into {target}", value.kind())
}

fn to_i64(value: &Value, target: &str) -> Result<i64, String> {
    match value {
        Value::Integer(i) => Ok(*i),
        Value::Float(x) if x.fract() == 0.0 && *x >= i64::MIN as f64 && *x < i64::MAX as f64 => {
            Ok(*x as i64)
        }
        Value::Float(x) => Err(format!("float {x} has a fractional part or overflows {target}")),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(mismatch(other, target)),
    }
}

macro_rules! from_value_int {
    ($($t:ty),*) => {
        $(impl FromValue for $t {
            fn from_value(value: &Value) -> Result<Self, String> {
                let wide = to_i64(value, stringify!($t))?;
                <$t>::try_from(wide)
                    .map_err(|_| format!("{wide} out of range for {}", stringify!($t)))
            }
        })*
    };
}

from_value_int!(i64, i32, i16, u64, u32, u16, u8, usize);

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Float(x) => Ok(*x),
            Value::Integer(i) => Ok(*i as f64),
            other => Err(mismatch(other, "f64")),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Integer(0) => Ok(false),
            Value::Integer(1) => Ok(true),
            other => Err(mismatch(other, "bool")),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            Value::Timestamp(ts) => Ok(ts.to_rfc3339()),
            other => Err(mismatch(other, "String")),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Blob(bytes) => Ok(bytes.clone()),
            Value::Text(s) => Ok(s.as_bytes().to_vec()),
            other => Err(mismatch(other, "Vec<u8>")),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Result<Self, String> {
        to_timestamp(value).ok_or_else(|| mismatch(value, "DateTime<Utc>"))
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, String> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// Layouts the store (and SQLite's date functions) produce.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Epoch seconds (integer or fractional) or a formatted string.
fn to_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Timestamp(ts) => Some(*ts),
        Value::Integer(secs) => Utc.timestamp_opt(*secs, 0).single(),
        Value::Float(secs) if secs.is_finite() => {
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9).round() as u32;
            Utc.timestamp_opt(whole as i64, nanos.min(999_999_999)).single()
        }
        Value::Text(text) => parse_time_text(text.trim()),
        _ => None,
    }
}

fn parse_time_text(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
    }
    if let Ok(secs) = text.parse::<i64>() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_widens_into_integer() {
        assert_eq!(i64::from_value(&Value::Float(42.0)), Ok(42));
        assert!(i64::from_value(&Value::Float(42.5)).is_err());
        assert_eq!(i32::from_value(&Value::Integer(7)), Ok(7));
        assert!(u8::from_value(&Value::Integer(300)).is_err());
    }

    #[test]
    fn test_integer_widens_into_float() {
        assert_eq!(f64::from_value(&Value::Integer(3)), Ok(3.0));
    }

    #[test]
    fn test_text_does_not_coerce_into_numbers() {
        assert!(i64::from_value(&Value::Text("12".into())).is_err());
        assert!(String::from_value(&Value::Integer(12)).is_err());
    }

    #[test]
    fn test_option_maps_null() {
        assert_eq!(Option::<String>::from_value(&Value::Null), Ok(None));
        assert_eq!(
            Option::<String>::from_value(&Value::Text("x".into())),
            Ok(Some("x".to_string()))
        );
        assert!(String::from_value(&Value::Null).is_err());
    }

    #[test]
    fn test_timestamps_from_epoch_and_text() {
        let meeting = Utc.with_ymd_and_hms(2424, 1, 2, 17, 0, 0).unwrap();

        let from_int = DateTime::<Utc>::from_value(&Value::Integer(meeting.timestamp())).unwrap();
        assert_eq!(from_int, meeting);

        let from_float =
            DateTime::<Utc>::from_value(&Value::Float(meeting.timestamp() as f64)).unwrap();
        assert_eq!(from_float, meeting);

        for text in ["2424-01-02 17:00:00", "2424-01-02T17:00:00Z", "2424-01-02T17:00:00"] {
            let parsed = DateTime::<Utc>::from_value(&Value::Text(text.into())).unwrap();
            assert_eq!(parsed, meeting, "parsing {text}");
        }

        assert!(DateTime::<Utc>::from_value(&Value::Text("yesterday".into())).is_err());
        assert!(DateTime::<Utc>::from_value(&Value::Bool(true)).is_err());
    }

    #[test]
    fn test_declared_types() {
        let ts = Value::Integer(0).with_declared_type("INT_DATETIME");
        assert!(matches!(ts, Value::Timestamp(_)));

        let untouched = Value::Text("not a date".into()).with_declared_type("datetime");
        assert_eq!(untouched, Value::Text("not a date".into()));

        let blob = Value::Text("AAEC".into()).with_declared_type("BLOB");
        assert_eq!(blob, Value::Blob(vec![0, 1, 2]));

        let plain = Value::Integer(5).with_declared_type("integer");
        assert_eq!(plain, Value::Integer(5));
    }

    #[test]
    fn test_serialization_keeps_argument_types() {
        let values = vec![
            Value::from(1),
            Value::from(2.5),
            Value::from("bob"),
            Value::from(true),
            Value::Null,
            Value::from(vec![0u8, 1, 2]),
        ];
        let encoded = serde_json::to_string(&values).unwrap();
        assert_eq!(encoded, r#"[1,2.5,"bob",true,null,"AAEC"]"#);
    }

    #[test]
    fn test_large_integers_survive_json() {
        let nanos: i64 = 1_700_000_000_123_456_789;
        let decoded = Value::from_json(serde_json::json!(nanos));
        assert_eq!(i64::from_value(&decoded), Ok(nanos));
    }
}
