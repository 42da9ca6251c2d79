//! Canonical wire forms and the named payload-transform registry.
//!
//! Every payload is stored as a string in the canonical form of its
//! declared [`DataType`]. [`coerce`] normalises raw ingress payloads into
//! that form (and is where type mismatches are caught), [`decode`] turns a
//! stored canonical string back into a typed value for egress.
//!
//! Mappings may name a transform to apply between coercion and enqueue.
//! Names are resolved once at configuration load; an unknown name is a
//! configuration error.

use chrono::{DateTime, FixedOffset};
use serde_json::Value;

use crate::error::BridgeError;
use crate::message::DataType;

/// A typed payload value, decoded from its canonical string form.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// Boolean payload.
    Bool(bool),
    /// 32-bit signed integer payload.
    Int32(i32),
    /// 32-bit float payload.
    Float(f32),
    /// 64-bit float payload.
    Double(f64),
    /// UTF-8 text payload.
    Text(String),
    /// Timestamp payload with its original offset.
    Timestamp(DateTime<FixedOffset>),
    /// JSON document payload.
    Json(Value),
}

impl WireValue {
    /// The canonical string form of this value.
    pub fn canonical(&self) -> String {
        match self {
            WireValue::Bool(b) => b.to_string(),
            WireValue::Int32(i) => i.to_string(),
            WireValue::Float(f) => f.to_string(),
            WireValue::Double(d) => d.to_string(),
            WireValue::Text(s) => s.clone(),
            WireValue::Timestamp(ts) => ts.to_rfc3339(),
            WireValue::Json(v) => v.to_string(),
        }
    }
}

fn coercion_error(raw: &str, data_type: DataType) -> BridgeError {
    BridgeError::TypeCoercion {
        value: raw.to_owned(),
        data_type,
    }
}

/// Normalise a raw ingress payload into the canonical form of
/// `data_type`.
///
/// Rejections (out-of-range integers, non-finite `Float` values, naive
/// timestamps, invalid JSON) are permanent: the message is archived, not
/// retried.
pub fn coerce(raw: &str, data_type: DataType) -> Result<String, BridgeError> {
    decode(raw, data_type).map(|value| value.canonical())
}

/// Decode a canonical payload string into a typed [`WireValue`].
pub fn decode(raw: &str, data_type: DataType) -> Result<WireValue, BridgeError> {
    let err = || coercion_error(raw, data_type);
    match data_type {
        DataType::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(WireValue::Bool(true)),
            "false" => Ok(WireValue::Bool(false)),
            _ => Err(err()),
        },
        DataType::Int32 => raw
            .trim()
            .parse::<i32>()
            .map(WireValue::Int32)
            .map_err(|_| err()),
        DataType::Float => {
            let parsed = raw.trim().parse::<f32>().map_err(|_| err())?;
            if parsed.is_finite() {
                Ok(WireValue::Float(parsed))
            } else {
                Err(err())
            }
        }
        DataType::Double => raw
            .trim()
            .parse::<f64>()
            .map(WireValue::Double)
            .map_err(|_| err()),
        DataType::String => Ok(WireValue::Text(raw.to_owned())),
        DataType::DateTime => DateTime::parse_from_rfc3339(raw.trim())
            .map(WireValue::Timestamp)
            .map_err(|_| err()),
        DataType::Json => serde_json::from_str::<Value>(raw)
            .map(WireValue::Json)
            .map_err(|_| err()),
    }
}

/// A payload transform applied between coercion and enqueue.
///
/// Takes and returns the canonical string form.
pub type Transform = fn(&str, DataType) -> Result<String, BridgeError>;

/// Resolve a transform by name.
///
/// Known names: `identity`, `negate`, `scale_percent`,
/// `celsius_to_fahrenheit`, `uppercase`. Unknown names fail
/// configuration loading.
pub fn resolve(name: &str) -> Result<Transform, BridgeError> {
    match name {
        "identity" => Ok(identity),
        "negate" => Ok(negate),
        "scale_percent" => Ok(scale_percent),
        "celsius_to_fahrenheit" => Ok(celsius_to_fahrenheit),
        "uppercase" => Ok(uppercase),
        other => Err(BridgeError::Configuration(format!(
            "unknown transform {other:?}"
        ))),
    }
}

/// The default transform: returns the payload unchanged.
pub fn identity(raw: &str, _data_type: DataType) -> Result<String, BridgeError> {
    Ok(raw.to_owned())
}

fn numeric(raw: &str, data_type: DataType) -> Result<f64, BridgeError> {
    match decode(raw, data_type)? {
        WireValue::Int32(i) => Ok(f64::from(i)),
        WireValue::Float(f) => Ok(f64::from(f)),
        WireValue::Double(d) => Ok(d),
        _ => Err(coercion_error(raw, data_type)),
    }
}

fn renumber(value: f64, data_type: DataType, raw: &str) -> Result<String, BridgeError> {
    if !value.is_finite() {
        return Err(coercion_error(raw, data_type));
    }
    match data_type {
        DataType::Int32 => {
            if value >= f64::from(i32::MIN) && value <= f64::from(i32::MAX) {
                Ok((value as i32).to_string())
            } else {
                Err(coercion_error(raw, data_type))
            }
        }
        DataType::Float => Ok((value as f32).to_string()),
        DataType::Double => Ok(value.to_string()),
        _ => Err(coercion_error(raw, data_type)),
    }
}

fn negate(raw: &str, data_type: DataType) -> Result<String, BridgeError> {
    match decode(raw, data_type)? {
        WireValue::Bool(b) => Ok((!b).to_string()),
        _ => {
            let value = numeric(raw, data_type)?;
            renumber(-value, data_type, raw)
        }
    }
}

fn scale_percent(raw: &str, data_type: DataType) -> Result<String, BridgeError> {
    let value = numeric(raw, data_type)?;
    renumber(value * 100.0, data_type, raw)
}

fn celsius_to_fahrenheit(raw: &str, data_type: DataType) -> Result<String, BridgeError> {
    let value = numeric(raw, data_type)?;
    renumber(value * 9.0 / 5.0 + 32.0, data_type, raw)
}

fn uppercase(raw: &str, data_type: DataType) -> Result<String, BridgeError> {
    match data_type {
        DataType::String => Ok(raw.to_uppercase()),
        _ => Err(coercion_error(raw, data_type)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    #[test]
    fn boolean_is_case_insensitive() {
        assert_eq!(coerce("TRUE", DataType::Boolean).unwrap(), "true");
        assert_eq!(coerce("False", DataType::Boolean).unwrap(), "false");
        assert_err!(coerce("yes", DataType::Boolean));
    }

    #[test]
    fn int32_enforces_range() {
        assert_eq!(coerce("-2147483648", DataType::Int32).unwrap(), "-2147483648");
        assert_err!(coerce("2147483648", DataType::Int32));
        assert_err!(coerce("12.5", DataType::Int32));
    }

    #[test]
    fn float_rejects_non_finite_but_double_passes_them() {
        assert_ok!(coerce("22.5", DataType::Float));
        assert_err!(coerce("NaN", DataType::Float));
        assert_err!(coerce("inf", DataType::Float));
        assert_err!(coerce("abc", DataType::Float));

        assert_ok!(coerce("inf", DataType::Double));
        assert_ok!(coerce("NaN", DataType::Double));
        assert_err!(coerce("abc", DataType::Double));
    }

    #[test]
    fn datetime_requires_offset() {
        assert_ok!(coerce("2026-08-02T10:15:00+02:00", DataType::DateTime));
        assert_ok!(coerce("2026-08-02T08:15:00Z", DataType::DateTime));
        assert_err!(coerce("2026-08-02T10:15:00", DataType::DateTime));
    }

    #[test]
    fn json_is_compacted() {
        let canonical = coerce("{ \"a\": 1 }", DataType::Json).unwrap();
        assert_eq!(canonical, "{\"a\":1}");
        assert_err!(coerce("{not json", DataType::Json));
    }

    #[test]
    fn round_trip_is_identity_for_canonical_values() {
        let cases = [
            ("true", DataType::Boolean),
            ("-42", DataType::Int32),
            ("22.5", DataType::Float),
            ("3.141592653589793", DataType::Double),
            ("hello", DataType::String),
            ("2026-08-02T08:15:00+00:00", DataType::DateTime),
            ("{\"a\":1}", DataType::Json),
        ];
        for (canonical, data_type) in cases {
            let decoded = decode(canonical, data_type).unwrap();
            assert_eq!(decoded.canonical(), canonical, "{data_type}");
        }
    }

    #[test]
    fn unknown_transform_is_a_configuration_error() {
        assert!(matches!(
            resolve("no_such_transform"),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[test]
    fn transforms_apply_to_canonical_payloads() {
        let scale = resolve("scale_percent").unwrap();
        assert_eq!(scale("0.25", DataType::Double).unwrap(), "25");

        let convert = resolve("celsius_to_fahrenheit").unwrap();
        assert_eq!(convert("100", DataType::Int32).unwrap(), "212");

        let flip = resolve("negate").unwrap();
        assert_eq!(flip("true", DataType::Boolean).unwrap(), "false");
        assert_eq!(flip("5", DataType::Int32).unwrap(), "-5");

        let upper = resolve("uppercase").unwrap();
        assert_eq!(upper("ok", DataType::String).unwrap(), "OK");
        assert_err!(upper("1", DataType::Int32));
    }
}
