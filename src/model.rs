/// Shared data types for the telemetry pipeline.
///
/// Readings flow in from stations as `InboundReading` (loosely typed wire
/// form), become `Reading` once validated, and are compared against
/// `ThresholdConfig` rules to produce `Alert`s. `AlertNotification` is the
/// outbound wire form of an alert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Sensor fields
// ---------------------------------------------------------------------------

/// Numeric sensor columns a reading may carry. Also the set of field names a
/// threshold rule is allowed to reference.
pub const NUMERIC_FIELDS: &[&str] = &[
    "temperature",
    "humidity",
    "pressure",
    "wind_speed",
    "precipitation",
    "solar_radiation",
    "battery_level",
];

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// Operational status reported by a station alongside its measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadingStatus {
    Ok,
    SensorError,
    CalibrationError,
    CommunicationError,
}

impl ReadingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::Ok => "OK",
            ReadingStatus::SensorError => "SENSOR_ERROR",
            ReadingStatus::CalibrationError => "CALIBRATION_ERROR",
            ReadingStatus::CommunicationError => "COMMUNICATION_ERROR",
        }
    }
}

impl FromStr for ReadingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(ReadingStatus::Ok),
            "SENSOR_ERROR" => Ok(ReadingStatus::SensorError),
            "CALIBRATION_ERROR" => Ok(ReadingStatus::CalibrationError),
            "COMMUNICATION_ERROR" => Ok(ReadingStatus::CommunicationError),
            other => Err(format!("unknown reading status: {}", other)),
        }
    }
}

/// A reading as it arrives on the wire.
///
/// Everything is optional and numeric fields are kept as raw JSON values:
/// deciding whether `"12.5"` or `"warm"` is acceptable is the validator's
/// job, not the decoder's. A payload that does not even decode into this
/// shape is malformed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundReading {
    pub station_id: Option<String>,
    pub timestamp: Option<String>,
    pub temperature: Option<serde_json::Value>,
    pub humidity: Option<serde_json::Value>,
    pub pressure: Option<serde_json::Value>,
    pub wind_speed: Option<serde_json::Value>,
    pub wind_direction: Option<String>,
    pub precipitation: Option<serde_json::Value>,
    pub solar_radiation: Option<serde_json::Value>,
    pub battery_level: Option<serde_json::Value>,
    pub status: Option<String>,
    /// Free-form station extras. An explicit `null` decodes as `None`.
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl InboundReading {
    /// Raw value of a numeric sensor field, if present and not JSON null.
    pub fn numeric_field(&self, name: &str) -> Option<&serde_json::Value> {
        let value = match name {
            "temperature" => self.temperature.as_ref(),
            "humidity" => self.humidity.as_ref(),
            "pressure" => self.pressure.as_ref(),
            "wind_speed" => self.wind_speed.as_ref(),
            "precipitation" => self.precipitation.as_ref(),
            "solar_radiation" => self.solar_radiation.as_ref(),
            "battery_level" => self.battery_level.as_ref(),
            _ => None,
        };
        value.filter(|v| !v.is_null())
    }
}

/// A validated reading. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub station_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<String>,
    pub precipitation: Option<f64>,
    pub solar_radiation: Option<f64>,
    pub battery_level: Option<f64>,
    pub status: ReadingStatus,
}

impl Reading {
    /// A reading with no sensor values, for building up in code and tests.
    pub fn new(station_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            station_id: station_id.into(),
            timestamp,
            temperature: None,
            humidity: None,
            pressure: None,
            wind_speed: None,
            wind_direction: None,
            precipitation: None,
            solar_radiation: None,
            battery_level: None,
            status: ReadingStatus::Ok,
        }
    }

    /// Value of a numeric sensor field by column name.
    pub fn field_value(&self, name: &str) -> Option<f64> {
        match name {
            "temperature" => self.temperature,
            "humidity" => self.humidity,
            "pressure" => self.pressure,
            "wind_speed" => self.wind_speed,
            "precipitation" => self.precipitation,
            "solar_radiation" => self.solar_radiation,
            "battery_level" => self.battery_level,
            _ => None,
        }
    }

    pub(crate) fn set_field(&mut self, name: &str, value: f64) {
        let slot = match name {
            "temperature" => &mut self.temperature,
            "humidity" => &mut self.humidity,
            "pressure" => &mut self.pressure,
            "wind_speed" => &mut self.wind_speed,
            "precipitation" => &mut self.precipitation,
            "solar_radiation" => &mut self.solar_radiation,
            "battery_level" => &mut self.battery_level,
            _ => return,
        };
        *slot = Some(value);
    }
}

// ---------------------------------------------------------------------------
// Threshold rules
// ---------------------------------------------------------------------------

/// Comparison operator of a threshold rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
}

impl ComparisonOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOp::Gt => ">",
            ComparisonOp::Lt => "<",
            ComparisonOp::Ge => ">=",
            ComparisonOp::Le => "<=",
            ComparisonOp::Eq => "=",
        }
    }

    /// Whether `observed <op> threshold` holds.
    pub fn matches(&self, observed: f64, threshold: f64) -> bool {
        match self {
            ComparisonOp::Gt => observed > threshold,
            ComparisonOp::Lt => observed < threshold,
            ComparisonOp::Ge => observed >= threshold,
            ComparisonOp::Le => observed <= threshold,
            ComparisonOp::Eq => observed == threshold,
        }
    }
}

impl FromStr for ComparisonOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" => Ok(ComparisonOp::Gt),
            "<" => Ok(ComparisonOp::Lt),
            ">=" => Ok(ComparisonOp::Ge),
            "<=" => Ok(ComparisonOp::Le),
            "=" => Ok(ComparisonOp::Eq),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity; also selects the notification routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Lowercase suffix appended to the alert routing key.
    pub fn routing_suffix(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INFO" => Ok(Severity::Info),
            "WARNING" => Ok(Severity::Warning),
            "CRITICAL" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {}", s)),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of `alert_configurations`. Owned by an external configuration
/// store; operator and severity are kept as stored and parsed per use so a
/// single bad row only affects itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdConfig {
    pub id: i32,
    /// Alert type raised when the rule fires.
    pub name: String,
    pub field_name: String,
    pub operator: String,
    pub threshold_value: f64,
    pub severity: String,
    pub enabled: bool,
}

impl ThresholdConfig {
    pub fn comparison(&self) -> Result<ComparisonOp, String> {
        self.operator.parse()
    }

    pub fn severity_level(&self) -> Result<Severity, String> {
        self.severity.parse()
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertStatus {
    New,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::New => "NEW",
            AlertStatus::Acknowledged => "ACKNOWLEDGED",
            AlertStatus::Resolved => "RESOLVED",
        }
    }

    /// Open alerts block a second alert for the same station and type.
    pub fn is_open(&self) -> bool {
        *self != AlertStatus::Resolved
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(AlertStatus::New),
            "ACKNOWLEDGED" => Ok(AlertStatus::Acknowledged),
            "RESOLVED" => Ok(AlertStatus::Resolved),
            other => Err(format!("unknown alert status: {}", other)),
        }
    }
}

/// A threshold alert. `id` and `created_at` are assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub id: Option<i64>,
    pub station_id: String,
    pub alert_type: String,
    pub message: String,
    pub alert_value: f64,
    pub threshold_value: f64,
    pub timestamp: DateTime<Utc>,
    pub status: AlertStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Outbound notification payload, published once per new alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    pub alert_id: i64,
    pub station_id: String,
    pub alert_type: String,
    pub alert_message: String,
    pub alert_value: f64,
    pub threshold_value: f64,
    pub timestamp: String,
    pub severity: Severity,
}

impl AlertNotification {
    /// Builds the notification for a persisted alert. Returns `None` if the
    /// alert has not been assigned an id yet.
    pub fn from_alert(alert: &Alert, severity: Severity) -> Option<Self> {
        Some(Self {
            alert_id: alert.id?,
            station_id: alert.station_id.clone(),
            alert_type: alert.alert_type.clone(),
            alert_message: alert.message.clone(),
            alert_value: alert.alert_value,
            threshold_value: alert.threshold_value,
            timestamp: alert.timestamp.to_rfc3339(),
            severity,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
