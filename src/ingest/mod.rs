/// Per-message ingestion state machine.
///
/// ```text
/// Received ──decode──▶ Validated ──insert──▶ Persisted ──▶ Ack
///    │                    │                     │
///    │ malformed          │ rejected            │ store failed
///    ▼                    ▼                     ▼
///   Ack (drop)          Ack (drop)            Requeue
/// ```
///
/// Malformed and invalid messages are acknowledged and dropped: they would
/// fail identically on every redelivery. Store failures are requeued; if
/// they persist, the queue's TTL moves the message to the dead-letter queue.
/// A panic anywhere in processing is treated as a fault and requeued.
///
/// └── observer — outcome reporting port and its implementations

pub mod observer;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::Disposition;
use crate::model::InboundReading;
use crate::store::{ReadingStore, StoreError};
use crate::validate::{validate, ValidationError};
use observer::{FailureReason, IngestObserver};

/// Terminal state of one message.
#[derive(Debug)]
pub enum Outcome {
    Stored { station_id: String },
    Malformed(String),
    Rejected { station_id: Option<String>, error: ValidationError },
    PersistFailed { station_id: String, error: StoreError },
    Faulted(String),
}

impl Outcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Outcome::Stored { .. } | Outcome::Malformed(_) | Outcome::Rejected { .. } => Disposition::Ack,
            Outcome::PersistFailed { .. } | Outcome::Faulted(_) => Disposition::Requeue,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Outcome::Stored { .. } => None,
            Outcome::Malformed(_) => Some(FailureReason::Malformed),
            Outcome::Rejected { .. } => Some(FailureReason::Validation),
            Outcome::PersistFailed { .. } => Some(FailureReason::Storage),
            Outcome::Faulted(_) => Some(FailureReason::Unexpected),
        }
    }
}

pub struct IngestionProcessor {
    store: Arc<dyn ReadingStore>,
    observer: Arc<dyn IngestObserver>,
}

impl IngestionProcessor {
    pub fn new(store: Arc<dyn ReadingStore>, observer: Arc<dyn IngestObserver>) -> Self {
        Self { store, observer }
    }

    /// Processes one delivery and returns what the broker should do with
    /// it. Reports exactly one outcome to the observer.
    pub fn handle(&self, payload: &[u8]) -> Disposition {
        let started = Instant::now();
        let outcome = self.process(payload);

        match outcome.failure_reason() {
            None => self.observer.message_processed(),
            Some(reason) => self.observer.message_failed(reason),
        }
        self.observer.processing_time(started.elapsed());

        outcome.disposition()
    }

    /// Runs the state machine, converting a panic into `Outcome::Faulted`.
    pub fn process(&self, payload: &[u8]) -> Outcome {
        match catch_unwind(AssertUnwindSafe(|| self.process_inner(payload))) {
            Ok(outcome) => outcome,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Unexpected error processing message: {}", msg);
                Outcome::Faulted(msg)
            }
        }
    }

    fn process_inner(&self, payload: &[u8]) -> Outcome {
        // Received
        let inbound: InboundReading = match serde_json::from_slice(payload) {
            Ok(inbound) => inbound,
            Err(e) => {
                error!("Failed to parse JSON message: {}", e);
                return Outcome::Malformed(e.to_string());
            }
        };
        let station = inbound.station_id.as_deref().unwrap_or("unknown");
        info!(station_id = station, "Received message from station");

        // Validated | Rejected
        let reading = match validate(&inbound) {
            Ok(reading) => reading,
            Err(error) => {
                warn!(station_id = station, reason = %error, "Invalid data");
                return Outcome::Rejected {
                    station_id: inbound.station_id.clone(),
                    error,
                };
            }
        };
        if let Some(meta) = inbound.metadata.as_ref().filter(|m| !m.is_empty()) {
            debug!(station_id = station, keys = meta.len(), "Metadata not persisted");
        }

        // Persisted | PersistFailed
        match self.store.insert(&reading) {
            Ok(()) => {
                info!(station_id = %reading.station_id, "Stored data for station");
                Outcome::Stored { station_id: reading.station_id }
            }
            Err(error) => {
                error!(station_id = %reading.station_id, transient = error.is_transient(), "Failed to store data: {}", error);
                Outcome::PersistFailed {
                    station_id: reading.station_id,
                    error,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
