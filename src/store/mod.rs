/// Persistence ports for readings and alerts.
///
/// `ReadingStore` is written by the ingestion path; `AlertStore` is written
/// only by the alert engine. Both read the same "latest reading per station"
/// projection, which the database maintains as a view.
///
/// ├── pg — pooled PostgreSQL implementation of both traits
/// └── memory (test only) — in-memory implementation with failure injection

pub mod pg;

#[cfg(test)]
pub(crate) mod memory;

use thiserror::Error;

use crate::model::{Alert, ComparisonOp, Reading, ThresholdConfig, NUMERIC_FIELDS};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2_postgres::r2d2::Error),

    #[error("database error: {0}")]
    Database(#[from] ::postgres::Error),

    #[error("unsupported threshold field: {0}")]
    UnsupportedField(String),

    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("invalid stored row: {0}")]
    InvalidRow(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient errors may succeed on redelivery; the rest will not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Pool(_) | StoreError::Database(_) | StoreError::Unavailable(_)
        )
    }
}

/// Checks that a threshold field names a numeric reading column. The name
/// ends up in SQL, so nothing else is allowed through.
pub fn checked_field(field: &str) -> Result<&'static str, StoreError> {
    NUMERIC_FIELDS
        .iter()
        .copied()
        .find(|f| *f == field)
        .ok_or_else(|| StoreError::UnsupportedField(field.to_string()))
}

pub trait ReadingStore: Send + Sync {
    /// Appends one reading. Redelivered messages produce duplicate rows.
    fn insert(&self, reading: &Reading) -> Result<(), StoreError>;

    /// Latest reading per station, optionally restricted to one station.
    fn latest(&self, station_id: Option<&str>) -> Result<Vec<Reading>, StoreError>;

    /// Latest-per-station readings whose `field` compares true against
    /// `value`. Readings without the field never match.
    fn threshold_exceeded(
        &self,
        field: &str,
        op: ComparisonOp,
        value: f64,
    ) -> Result<Vec<Reading>, StoreError>;
}

pub trait AlertStore: ReadingStore {
    fn enabled_thresholds(&self) -> Result<Vec<ThresholdConfig>, StoreError>;

    /// Any non-RESOLVED alert for the pair, newest first.
    fn open_alert(&self, station_id: &str, alert_type: &str) -> Result<Option<Alert>, StoreError>;

    /// Persists a new alert and returns its assigned id.
    fn save_alert(&self, alert: &Alert) -> Result<i64, StoreError>;
}
