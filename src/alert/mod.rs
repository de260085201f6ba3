/// Threshold alert evaluation.
///
/// One pass walks every enabled threshold configuration, finds the stations
/// whose latest reading crosses it, and raises one alert per station unless
/// an open (non-RESOLVED) alert of the same type already exists. New alerts
/// are persisted first and only then notified; a failed notification leaves
/// the alert in place.
///
/// The open-alert check and the insert are separate statements, so only one
/// engine may evaluate at a time. The scheduler thread is that one engine.
///
/// └── notify — notification payload, routing and delivery

pub mod notify;

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::model::{Alert, AlertStatus, ComparisonOp, Reading, Severity, ThresholdConfig};
use crate::store::{AlertStore, StoreError};
use notify::Notifier;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("threshold '{name}' has {reason}")]
    InvalidConfig { name: String, reason: String },
}

/// Tally of one evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub configs_evaluated: usize,
    pub configs_failed: usize,
    pub alerts_created: usize,
    pub duplicates_skipped: usize,
    pub alerts_failed: usize,
    pub notifications_failed: usize,
}

/// Human-readable alert text, e.g. `High Temperature: temperature 40 > 35`.
pub fn alert_message(config: &ThresholdConfig, op: ComparisonOp, value: f64) -> String {
    format!(
        "{}: {} {} {} {}",
        config.name, config.field_name, value, op, config.threshold_value
    )
}

pub struct AlertEngine<N: Notifier> {
    store: Arc<dyn AlertStore>,
    notifier: N,
}

impl<N: Notifier> AlertEngine<N> {
    pub fn new(store: Arc<dyn AlertStore>, notifier: N) -> Self {
        Self { store, notifier }
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Runs one evaluation pass. Only loading the configurations can fail
    /// the whole pass; everything after that is isolated per configuration
    /// and per station.
    pub fn check_alerts(&mut self) -> Result<PassSummary, AlertError> {
        let configs = self.store.enabled_thresholds()?;
        let mut summary = PassSummary::default();

        if configs.is_empty() {
            info!("No alert configurations found");
            return Ok(summary);
        }

        for config in &configs {
            summary.configs_evaluated += 1;
            if let Err(e) = self.evaluate(config, &mut summary) {
                summary.configs_failed += 1;
                error!(alert_type = %config.name, config_id = config.id, "Error checking alert configuration: {}", e);
            }
        }

        info!(
            configs = summary.configs_evaluated,
            created = summary.alerts_created,
            skipped = summary.duplicates_skipped,
            failed = summary.configs_failed + summary.alerts_failed,
            notify_failed = summary.notifications_failed,
            "Alert pass complete"
        );
        Ok(summary)
    }

    fn evaluate(&mut self, config: &ThresholdConfig, summary: &mut PassSummary) -> Result<(), AlertError> {
        let op = config.comparison().map_err(|_| StoreError::UnsupportedOperator(config.operator.clone()))?;
        let severity = config.severity_level().map_err(|reason| AlertError::InvalidConfig {
            name: config.name.clone(),
            reason,
        })?;

        let readings = self
            .store
            .threshold_exceeded(&config.field_name, op, config.threshold_value)?;
        debug!(alert_type = %config.name, matches = readings.len(), "Threshold query complete");

        for reading in &readings {
            if let Err(e) = self.raise(config, op, severity, reading, summary) {
                summary.alerts_failed += 1;
                error!(
                    alert_type = %config.name,
                    station_id = %reading.station_id,
                    "Failed to raise alert: {}",
                    e
                );
            }
        }
        Ok(())
    }

    fn raise(
        &mut self,
        config: &ThresholdConfig,
        op: ComparisonOp,
        severity: Severity,
        reading: &Reading,
        summary: &mut PassSummary,
    ) -> Result<(), StoreError> {
        // threshold_exceeded only returns readings carrying the field
        let Some(value) = reading.field_value(&config.field_name) else {
            return Ok(());
        };

        if let Some(open) = self.store.open_alert(&reading.station_id, &config.name)? {
            summary.duplicates_skipped += 1;
            debug!(
                station_id = %reading.station_id,
                alert_type = %config.name,
                open_alert_id = ?open.id,
                "Open alert exists, skipping"
            );
            return Ok(());
        }

        let mut alert = Alert {
            id: None,
            station_id: reading.station_id.clone(),
            alert_type: config.name.clone(),
            message: alert_message(config, op, value),
            alert_value: value,
            threshold_value: config.threshold_value,
            timestamp: Utc::now(),
            status: AlertStatus::New,
            created_at: None,
            resolved_at: None,
        };
        alert.id = Some(self.store.save_alert(&alert)?);
        summary.alerts_created += 1;
        info!(
            station_id = %alert.station_id,
            alert_type = %alert.alert_type,
            severity = %severity,
            "Created alert: {}",
            alert.message
        );

        if let Err(e) = self.notifier.send_alert(&alert, severity) {
            summary.notifications_failed += 1;
            warn!(
                station_id = %alert.station_id,
                alert_type = %alert.alert_type,
                "Alert saved but notification failed: {}",
                e
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::ReadingStore;
    use chrono::TimeZone;
    use notify::NotifyError;

    /// Records what it was asked to send; can be told to fail.
    #[derive(Default)]
    struct RecordingNotifier {
        sent: Vec<(Alert, Severity)>,
        fail: bool,
    }

    impl Notifier for RecordingNotifier {
        fn send_alert(&mut self, alert: &Alert, severity: Severity) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Publish(crate::broker::BrokerError::NotConnected));
            }
            self.sent.push((alert.clone(), severity));
            Ok(())
        }
    }

    fn threshold(id: i32, name: &str, field: &str, op: &str, value: f64, severity: &str) -> ThresholdConfig {
        ThresholdConfig {
            id,
            name: name.to_string(),
            field_name: field.to_string(),
            operator: op.to_string(),
            threshold_value: value,
            severity: severity.to_string(),
            enabled: true,
        }
    }

    fn high_temperature() -> ThresholdConfig {
        threshold(1, "High Temperature", "temperature", ">", 35.0, "WARNING")
    }

    fn reading(station: &str, hour: u32, temperature: f64) -> Reading {
        let mut r = Reading::new(station, Utc.with_ymd_and_hms(2024, 7, 1, hour, 0, 0).unwrap());
        r.temperature = Some(temperature);
        r
    }

    fn engine(store: &Arc<MemoryStore>) -> AlertEngine<RecordingNotifier> {
        AlertEngine::new(store.clone(), RecordingNotifier::default())
    }

    fn open_alerts(store: &MemoryStore, station: &str, alert_type: &str) -> usize {
        store
            .alerts()
            .iter()
            .filter(|a| a.station_id == station && a.alert_type == alert_type && a.status.is_open())
            .count()
    }

    #[test]
    fn test_exceeding_reading_raises_one_alert_then_none() {
        let store = Arc::new(MemoryStore::with_thresholds(vec![high_temperature()]));
        store.insert(&reading("WS-1", 12, 40.0)).unwrap();
        let mut engine = engine(&store);

        let first = engine.check_alerts().unwrap();
        assert_eq!(first.alerts_created, 1);
        assert_eq!(engine.notifier().sent.len(), 1);

        let (alert, severity) = &engine.notifier().sent[0];
        assert_eq!(alert.id, Some(1));
        assert_eq!(alert.alert_type, "High Temperature");
        assert_eq!(alert.alert_value, 40.0);
        assert_eq!(alert.threshold_value, 35.0);
        assert_eq!(alert.status, AlertStatus::New);
        assert_eq!(alert.message, "High Temperature: temperature 40 > 35");
        assert_eq!(*severity, Severity::Warning);

        let second = engine.check_alerts().unwrap();
        assert_eq!(second.alerts_created, 0);
        assert_eq!(second.duplicates_skipped, 1);
        assert_eq!(engine.notifier().sent.len(), 1);
        assert_eq!(open_alerts(&store, "WS-1", "High Temperature"), 1);
    }

    #[test]
    fn test_only_latest_reading_is_evaluated() {
        let store = Arc::new(MemoryStore::with_thresholds(vec![high_temperature()]));
        store.insert(&reading("WS-1", 11, 40.0)).unwrap();
        store.insert(&reading("WS-1", 12, 30.0)).unwrap();

        let summary = engine(&store).check_alerts().unwrap();
        assert_eq!(summary.alerts_created, 0);
    }

    #[test]
    fn test_each_station_gets_its_own_alert() {
        let store = Arc::new(MemoryStore::with_thresholds(vec![high_temperature()]));
        store.insert(&reading("WS-1", 12, 40.0)).unwrap();
        store.insert(&reading("WS-2", 12, 36.5)).unwrap();
        store.insert(&reading("WS-3", 12, 20.0)).unwrap();

        let summary = engine(&store).check_alerts().unwrap();
        assert_eq!(summary.alerts_created, 2);
        assert_eq!(open_alerts(&store, "WS-1", "High Temperature"), 1);
        assert_eq!(open_alerts(&store, "WS-2", "High Temperature"), 1);
        assert_eq!(open_alerts(&store, "WS-3", "High Temperature"), 0);
    }

    #[test]
    fn test_resolved_alert_allows_a_new_one() {
        let store = Arc::new(MemoryStore::with_thresholds(vec![high_temperature()]));
        store.insert(&reading("WS-1", 12, 40.0)).unwrap();
        let mut engine = engine(&store);

        engine.check_alerts().unwrap();
        store.resolve_alerts("WS-1", "High Temperature");
        let summary = engine.check_alerts().unwrap();

        assert_eq!(summary.alerts_created, 1);
        assert_eq!(store.alerts().len(), 2);
        assert_eq!(open_alerts(&store, "WS-1", "High Temperature"), 1);
    }

    #[test]
    fn test_no_configurations_is_a_no_op() {
        let store = Arc::new(MemoryStore::default());
        store.insert(&reading("WS-1", 12, 40.0)).unwrap();

        let summary = engine(&store).check_alerts().unwrap();
        assert_eq!(summary, PassSummary::default());
        assert!(store.alerts().is_empty());
    }

    #[test]
    fn test_bad_configuration_does_not_abort_the_pass() {
        let store = Arc::new(MemoryStore::with_thresholds(vec![
            threshold(1, "Bad Operator", "temperature", "!=", 0.0, "INFO"),
            threshold(2, "Bad Field", "wind_direction", ">", 0.0, "INFO"),
            threshold(3, "Bad Severity", "temperature", ">", 0.0, "PANIC"),
            high_temperature(),
        ]));
        store.insert(&reading("WS-1", 12, 40.0)).unwrap();

        let summary = engine(&store).check_alerts().unwrap();
        assert_eq!(summary.configs_evaluated, 4);
        assert_eq!(summary.configs_failed, 3);
        assert_eq!(summary.alerts_created, 1);
        assert_eq!(store.alerts()[0].alert_type, "High Temperature");
    }

    #[test]
    fn test_query_failure_is_isolated_to_its_configuration() {
        let store = Arc::new(MemoryStore::with_thresholds(vec![
            threshold(1, "Low Battery", "battery_level", "<", 20.0, "CRITICAL"),
            high_temperature(),
        ]));
        store.fail_queries_on("battery_level", StoreError::Unavailable("timeout".into()));
        store.insert(&reading("WS-1", 12, 40.0)).unwrap();

        let summary = engine(&store).check_alerts().unwrap();
        assert_eq!(summary.configs_failed, 1);
        assert_eq!(summary.alerts_created, 1);
    }

    #[test]
    fn test_failed_save_skips_notification() {
        let store = Arc::new(MemoryStore::with_thresholds(vec![high_temperature()]));
        store.insert(&reading("WS-1", 12, 40.0)).unwrap();
        store.insert(&reading("WS-2", 12, 41.0)).unwrap();
        store.fail_next_save(StoreError::Unavailable("disk full".into()));
        let mut engine = engine(&store);

        let summary = engine.check_alerts().unwrap();
        assert_eq!(summary.alerts_failed, 1);
        assert_eq!(summary.alerts_created, 1);
        assert_eq!(engine.notifier().sent.len(), 1);
    }

    #[test]
    fn test_notification_failure_keeps_the_alert() {
        let store = Arc::new(MemoryStore::with_thresholds(vec![high_temperature()]));
        store.insert(&reading("WS-1", 12, 40.0)).unwrap();
        let mut engine = AlertEngine::new(
            store.clone(),
            RecordingNotifier {
                fail: true,
                ..RecordingNotifier::default()
            },
        );

        let summary = engine.check_alerts().unwrap();
        assert_eq!(summary.alerts_created, 1);
        assert_eq!(summary.notifications_failed, 1);
        assert_eq!(open_alerts(&store, "WS-1", "High Temperature"), 1);

        // not retried on the next pass either
        let again = engine.check_alerts().unwrap();
        assert_eq!(again.alerts_created, 0);
        assert_eq!(again.duplicates_skipped, 1);
    }

    #[test]
    fn test_at_most_one_open_alert_per_pair_across_passes() {
        let store = Arc::new(MemoryStore::with_thresholds(vec![
            high_temperature(),
            threshold(2, "Extreme Heat", "temperature", ">=", 40.0, "CRITICAL"),
        ]));
        let mut engine = engine(&store);

        for hour in 0..5 {
            store.insert(&reading("WS-1", hour, 38.0 + hour as f64)).unwrap();
            store.insert(&reading("WS-2", hour, 45.0)).unwrap();
            engine.check_alerts().unwrap();

            for station in ["WS-1", "WS-2"] {
                for alert_type in ["High Temperature", "Extreme Heat"] {
                    assert!(open_alerts(&store, station, alert_type) <= 1);
                }
            }
        }
        assert_eq!(store.alerts().len(), 4);
    }

    #[test]
    fn test_alert_message_format() {
        let config = threshold(1, "Low Pressure", "pressure", "<=", 980.5, "INFO");
        assert_eq!(
            alert_message(&config, ComparisonOp::Le, 975.25),
            "Low Pressure: pressure 975.25 <= 980.5"
        );
    }
}
