/// Alert notification delivery.
///
/// Each new alert is published once to `<base>.<severity>` on the pipeline
/// exchange, e.g. `weather.alerts.critical`, so subscribers can bind to a
/// single severity or to `weather.alerts.#`.

use thiserror::Error;
use tracing::{info, warn};

use crate::broker::{BrokerError, Publisher};
use crate::model::{Alert, AlertNotification, Severity};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("alert has not been persisted (no id)")]
    Unsaved,

    #[error("failed to serialize notification: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish failed after reconnect: {0}")]
    Publish(#[source] BrokerError),
}

/// Sends notifications for persisted alerts.
pub trait Notifier {
    fn send_alert(&mut self, alert: &Alert, severity: Severity) -> Result<(), NotifyError>;
}

/// Routing key for a severity: `weather.alerts` + `CRITICAL` gives
/// `weather.alerts.critical`.
pub fn routing_key(base: &str, severity: Severity) -> String {
    format!("{}.{}", base, severity.routing_suffix())
}

/// Publishes notifications through a broker connection.
pub struct BrokerNotifier<P: Publisher> {
    publisher: P,
    base_routing_key: String,
}

impl<P: Publisher> BrokerNotifier<P> {
    pub fn new(publisher: P, base_routing_key: impl Into<String>) -> Self {
        Self {
            publisher,
            base_routing_key: base_routing_key.into(),
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }
}

impl<P: Publisher> Notifier for BrokerNotifier<P> {
    fn send_alert(&mut self, alert: &Alert, severity: Severity) -> Result<(), NotifyError> {
        let notification = AlertNotification::from_alert(alert, severity).ok_or(NotifyError::Unsaved)?;
        let payload = serde_json::to_vec(&notification)?;
        let key = routing_key(&self.base_routing_key, severity);

        if let Err(first) = self.publisher.publish(&key, &payload) {
            warn!(routing_key = %key, "Publish failed ({}), reconnecting once", first);
            self.publisher.reconnect().map_err(NotifyError::Publish)?;
            self.publisher.publish(&key, &payload).map_err(NotifyError::Publish)?;
        }

        info!(
            alert_id = notification.alert_id,
            station_id = %alert.station_id,
            routing_key = %key,
            "Sent alert notification: {}",
            alert.message
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
