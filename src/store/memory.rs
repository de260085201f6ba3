/// In-memory store for unit tests, cfg(test) gated.
///
/// Mirrors the PostgreSQL semantics the pipeline relies on: append-only
/// readings, a latest-per-station projection, newest-first open alert
/// lookup and sequential alert ids. Failures can be queued up front to
/// exercise the requeue and isolation paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{checked_field, AlertStore, ReadingStore, StoreError};
use crate::model::{Alert, ComparisonOp, Reading, ThresholdConfig};

#[derive(Default)]
pub(crate) struct MemoryStore {
    readings: Mutex<Vec<Reading>>,
    alerts: Mutex<Vec<Alert>>,
    thresholds: Mutex<Vec<ThresholdConfig>>,
    insert_failures: Mutex<VecDeque<StoreError>>,
    query_failures: Mutex<HashMap<String, StoreError>>,
    save_failures: Mutex<VecDeque<StoreError>>,
}

impl MemoryStore {
    pub fn with_thresholds(thresholds: Vec<ThresholdConfig>) -> Self {
        let store = Self::default();
        *store.thresholds.lock().unwrap() = thresholds;
        store
    }

    /// The next `insert` call fails with `err`.
    pub fn fail_next_insert(&self, err: StoreError) {
        self.insert_failures.lock().unwrap().push_back(err);
    }

    /// Every threshold query on `field` fails with `err`.
    pub fn fail_queries_on(&self, field: &str, err: StoreError) {
        self.query_failures.lock().unwrap().insert(field.to_string(), err);
    }

    /// The next `save_alert` call fails with `err`.
    pub fn fail_next_save(&self, err: StoreError) {
        self.save_failures.lock().unwrap().push_back(err);
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.readings.lock().unwrap().clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    /// Operator-side status change, out of the engine's hands.
    pub fn resolve_alerts(&self, station_id: &str, alert_type: &str) {
        for alert in self.alerts.lock().unwrap().iter_mut() {
            if alert.station_id == station_id && alert.alert_type == alert_type {
                alert.status = crate::model::AlertStatus::Resolved;
            }
        }
    }
}

/// `StoreError` is not `Clone`, so a sticky failure is replayed as
/// `Unavailable` carrying its message.
fn take_failure(errors: &Mutex<HashMap<String, StoreError>>, field: &str) -> Option<StoreError> {
    errors.lock().unwrap().get(field).map(|e| StoreError::Unavailable(e.to_string()))
}

impl ReadingStore for MemoryStore {
    fn insert(&self, reading: &Reading) -> Result<(), StoreError> {
        if let Some(err) = self.insert_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.readings.lock().unwrap().push(reading.clone());
        Ok(())
    }

    fn latest(&self, station_id: Option<&str>) -> Result<Vec<Reading>, StoreError> {
        let mut latest: HashMap<String, Reading> = HashMap::new();
        for reading in self.readings.lock().unwrap().iter() {
            match latest.get(&reading.station_id) {
                Some(existing) if existing.timestamp > reading.timestamp => {}
                _ => {
                    latest.insert(reading.station_id.clone(), reading.clone());
                }
            }
        }
        let mut rows: Vec<Reading> = latest
            .into_values()
            .filter(|r| station_id.is_none_or(|id| r.station_id == id))
            .collect();
        rows.sort_by(|a, b| a.station_id.cmp(&b.station_id));
        Ok(rows)
    }

    fn threshold_exceeded(
        &self,
        field: &str,
        op: ComparisonOp,
        value: f64,
    ) -> Result<Vec<Reading>, StoreError> {
        let column = checked_field(field)?;
        if let Some(err) = take_failure(&self.query_failures, column) {
            return Err(err);
        }
        Ok(self
            .latest(None)?
            .into_iter()
            .filter(|r| r.field_value(column).is_some_and(|v| op.matches(v, value)))
            .collect())
    }
}

impl AlertStore for MemoryStore {
    fn enabled_thresholds(&self) -> Result<Vec<ThresholdConfig>, StoreError> {
        Ok(self
            .thresholds
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .collect())
    }

    fn open_alert(&self, station_id: &str, alert_type: &str) -> Result<Option<Alert>, StoreError> {
        Ok(self
            .alerts
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.station_id == station_id && a.alert_type == alert_type && a.status.is_open())
            .max_by_key(|a| a.timestamp)
            .cloned())
    }

    fn save_alert(&self, alert: &Alert) -> Result<i64, StoreError> {
        if let Some(err) = self.save_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut alerts = self.alerts.lock().unwrap();
        let id = alerts.len() as i64 + 1;
        let mut stored = alert.clone();
        stored.id = Some(id);
        stored.created_at = Some(chrono::Utc::now());
        alerts.push(stored);
        Ok(id)
    }
}
