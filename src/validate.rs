/// Structural and range validation of inbound station readings.
///
/// Rules are applied in order and the first failure wins:
///   1. `station_id`, `timestamp` and `status` must be present and not blank
///   2. `timestamp` must be an ISO-8601 instant (trailing `Z` accepted)
///   3. each present numeric field must be a number within its fixed range
///   4. `status` must be a known station status
///
/// Validation failures are permanent: the message that carried the reading
/// is dropped, never requeued.

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

use crate::model::{InboundReading, Reading, ReadingStatus, NUMERIC_FIELDS};

/// Inclusive physical ranges for range-checked sensor fields.
/// `solar_radiation` is numeric but unbounded.
pub const FIELD_RANGES: &[(&str, f64, f64)] = &[
    ("temperature", -80.0, 60.0),
    ("humidity", 0.0, 100.0),
    ("pressure", 800.0, 1200.0),
    ("wind_speed", 0.0, 200.0),
    ("precipitation", 0.0, 500.0),
    ("battery_level", 0.0, 100.0),
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid timestamp format: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid {field} value: {value}")]
    NotNumeric { field: &'static str, value: String },

    #[error("{field} out of range: {value} (expected {min}-{max})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid status: {0}")]
    UnknownStatus(String),
}

impl ValidationError {
    /// The reading field the failure is about.
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::MissingField(field) => field,
            ValidationError::InvalidTimestamp(_) => "timestamp",
            ValidationError::NotNumeric { field, .. } => field,
            ValidationError::OutOfRange { field, .. } => field,
            ValidationError::UnknownStatus(_) => "status",
        }
    }
}

/// Validates an inbound reading and converts it into a storable `Reading`.
pub fn validate(inbound: &InboundReading) -> Result<Reading, ValidationError> {
    let station_id = required(&inbound.station_id, "station_id")?;
    let timestamp_raw = required(&inbound.timestamp, "timestamp")?;
    let status_raw = required(&inbound.status, "status")?;

    let timestamp = parse_timestamp(timestamp_raw)
        .ok_or_else(|| ValidationError::InvalidTimestamp(timestamp_raw.to_string()))?;

    let mut reading = Reading::new(station_id, timestamp);

    for &field in NUMERIC_FIELDS {
        let Some(raw) = inbound.numeric_field(field) else {
            continue;
        };
        let value = as_number(raw).ok_or_else(|| ValidationError::NotNumeric {
            field,
            value: raw.to_string(),
        })?;

        if let Some(&(_, min, max)) = FIELD_RANGES.iter().find(|(name, _, _)| *name == field) {
            // NaN fails the containment check as well
            if !(min..=max).contains(&value) {
                return Err(ValidationError::OutOfRange { field, value, min, max });
            }
        } else if !value.is_finite() {
            return Err(ValidationError::NotNumeric { field, value: raw.to_string() });
        }

        reading.set_field(field, value);
    }

    reading.status = status_raw
        .parse::<ReadingStatus>()
        .map_err(|_| ValidationError::UnknownStatus(status_raw.to_string()))?;
    reading.wind_direction = inbound.wind_direction.clone().filter(|d| !d.is_empty());

    Ok(reading)
}

/// The field's value as sent. Whitespace only counts as missing but is
/// never stripped from a value that is kept.
fn required<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, ValidationError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ValidationError::MissingField(field)),
    }
}

/// Parses an ISO-8601 instant. Offset-less date-times are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // RFC 3339 requires seconds; ISO-8601 allows "2024-07-01T12:00+00:00"
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Accepts JSON numbers and numeric strings.
fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
