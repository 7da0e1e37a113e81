//! Execution records as returned by the describe API.
//!
//! Records are semi-structured: string keys mapping to scalars, timestamps,
//! lists and nested maps. Serialization renders temporal values as ISO-8601
//! text and rejects values that have no JSON representation.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Timelike};
use indexmap::IndexMap;
use serde::ser::{Error as _, Serialize, SerializeMap, SerializeSeq, Serializer};

/// One query execution's details, in field insertion order.
pub type ExecutionRecord = IndexMap<String, RecordValue>;

/// A single field value of an [`ExecutionRecord`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Timestamp without an offset.
    Timestamp(NaiveDateTime),
    /// Timestamp with a UTC offset.
    ZonedTimestamp(DateTime<FixedOffset>),
    Date(NaiveDate),
    List(Vec<RecordValue>),
    Map(IndexMap<String, RecordValue>),
    /// Raw bytes. Not representable in JSON.
    Bytes(Vec<u8>),
}

impl RecordValue {
    /// Name of the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            RecordValue::Null => "null",
            RecordValue::Bool(_) => "bool",
            RecordValue::Int(_) => "int",
            RecordValue::Float(_) => "float",
            RecordValue::String(_) => "string",
            RecordValue::Timestamp(_) => "timestamp",
            RecordValue::ZonedTimestamp(_) => "zoned timestamp",
            RecordValue::Date(_) => "date",
            RecordValue::List(_) => "list",
            RecordValue::Map(_) => "map",
            RecordValue::Bytes(_) => "bytes",
        }
    }
}

/// ISO-8601 extended rendering of a naive timestamp.
///
/// Fractional seconds appear only when the microsecond part is non-zero.
pub fn iso_timestamp(ts: &NaiveDateTime) -> String {
    let mut out = ts.format("%Y-%m-%dT%H:%M:%S").to_string();
    let micros = ts.nanosecond() % 1_000_000_000 / 1_000;
    if micros != 0 {
        out.push_str(&format!(".{micros:06}"));
    }
    out
}

/// ISO-8601 extended rendering of a timestamp with its offset (`+00:00` for UTC).
pub fn iso_zoned_timestamp(ts: &DateTime<FixedOffset>) -> String {
    let mut out = iso_timestamp(&ts.naive_local());
    out.push_str(&ts.format("%:z").to_string());
    out
}

impl Serialize for RecordValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RecordValue::Null => serializer.serialize_unit(),
            RecordValue::Bool(b) => serializer.serialize_bool(*b),
            RecordValue::Int(i) => serializer.serialize_i64(*i),
            RecordValue::Float(f) if f.is_finite() => serializer.serialize_f64(*f),
            RecordValue::Float(f) => Err(S::Error::custom(format!(
                "float value {f} is not JSON serializable"
            ))),
            RecordValue::String(s) => serializer.serialize_str(s),
            RecordValue::Timestamp(ts) => serializer.serialize_str(&iso_timestamp(ts)),
            RecordValue::ZonedTimestamp(ts) => serializer.serialize_str(&iso_zoned_timestamp(ts)),
            RecordValue::Date(d) => serializer.serialize_str(&d.format("%Y-%m-%d").to_string()),
            RecordValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            RecordValue::Map(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (key, value) in fields {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            RecordValue::Bytes(bytes) => Err(S::Error::custom(format!(
                "value of type {} ({} bytes) is not JSON serializable",
                self.type_name(),
                bytes.len()
            ))),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for RecordValue {
                fn from(value: $ty) -> Self {
                    RecordValue::$variant(value.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i32 => Int,
    i64 => Int,
    f64 => Float,
    String => String,
    &str => String,
    NaiveDateTime => Timestamp,
    DateTime<FixedOffset> => ZonedTimestamp,
    NaiveDate => Date,
    Vec<RecordValue> => List,
    IndexMap<String, RecordValue> => Map,
}

impl<T: Into<RecordValue>> From<Option<T>> for RecordValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(RecordValue::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").unwrap()
    }

    #[test]
    fn test_timestamp_without_fraction() {
        assert_eq!(
            iso_timestamp(&naive("2023-01-01T00:00:00")),
            "2023-01-01T00:00:00"
        );
    }

    #[test]
    fn test_timestamp_with_microseconds() {
        assert_eq!(
            iso_timestamp(&naive("2023-06-15T12:30:45.123")),
            "2023-06-15T12:30:45.123000"
        );
        // Sub-microsecond precision is truncated.
        assert_eq!(
            iso_timestamp(&naive("2023-06-15T12:30:45.000000500")),
            "2023-06-15T12:30:45"
        );
    }

    #[test]
    fn test_zoned_timestamp_keeps_offset() {
        let utc = DateTime::parse_from_rfc3339("2024-03-01T08:00:00Z").unwrap();
        assert_eq!(iso_zoned_timestamp(&utc), "2024-03-01T08:00:00+00:00");

        let offset = DateTime::parse_from_rfc3339("2024-03-01T08:00:00.250+05:30").unwrap();
        assert_eq!(
            iso_zoned_timestamp(&offset),
            "2024-03-01T08:00:00.250000+05:30"
        );
    }

    #[test]
    fn test_nested_values_serialize() {
        let mut status = IndexMap::new();
        status.insert("State".to_string(), RecordValue::from("SUCCEEDED"));
        status.insert(
            "CompletionDateTime".to_string(),
            RecordValue::from(naive("2023-01-01T00:00:05")),
        );

        let value = RecordValue::List(vec![
            RecordValue::Map(status),
            RecordValue::Null,
            RecordValue::from(3),
            RecordValue::from(true),
            RecordValue::Date(NaiveDate::from_ymd_opt(2023, 1, 2).unwrap()),
        ]);

        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(
            json,
            r#"[{"State":"SUCCEEDED","CompletionDateTime":"2023-01-01T00:00:05"},null,3,true,"2023-01-02"]"#
        );
    }

    #[test]
    fn test_bytes_are_rejected() {
        let err = serde_json::to_string(&RecordValue::Bytes(vec![1, 2, 3])).unwrap_err();
        assert!(err.to_string().contains("not JSON serializable"));
    }

    #[test]
    fn test_non_finite_float_is_rejected() {
        assert!(serde_json::to_string(&RecordValue::Float(f64::NAN)).is_err());
        assert_eq!(
            serde_json::to_string(&RecordValue::Float(1.5)).unwrap(),
            "1.5"
        );
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(RecordValue::from(None::<String>), RecordValue::Null);
        assert_eq!(
            RecordValue::from(Some("x")),
            RecordValue::String("x".to_string())
        );
    }
}
