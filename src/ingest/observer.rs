/// Observability port for the ingestion path.
///
/// The processor reports exactly one outcome per message plus its latency.
/// Implementations decide what to do with it; nothing here depends on a
/// metrics backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Failure label attached to a non-processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Payload did not decode.
    Malformed,
    /// Decoded but failed validation.
    Validation,
    /// Store rejected or could not take the write.
    Storage,
    /// Processing panicked.
    Unexpected,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Malformed => "json_parse",
            FailureReason::Validation => "validation",
            FailureReason::Storage => "processing",
            FailureReason::Unexpected => "unexpected",
        }
    }
}

pub trait IngestObserver: Send + Sync {
    fn message_processed(&self);
    fn message_failed(&self, reason: FailureReason);
    fn processing_time(&self, elapsed: Duration);
}

/// Emits outcomes as debug-level tracing events.
#[derive(Debug, Default)]
pub struct LogObserver;

impl IngestObserver for LogObserver {
    fn message_processed(&self) {
        debug!(outcome = "processed", "Ingestion outcome");
    }

    fn message_failed(&self, reason: FailureReason) {
        debug!(outcome = "failed", reason = reason.as_str(), "Ingestion outcome");
    }

    fn processing_time(&self, elapsed: Duration) {
        debug!(elapsed_ms = elapsed.as_millis() as u64, "Message processing time");
    }
}

/// Running totals, shared between the consumer and whoever reports them.
#[derive(Debug, Default)]
pub struct OutcomeCounters {
    processed: AtomicU64,
    malformed: AtomicU64,
    validation: AtomicU64,
    storage: AtomicU64,
    unexpected: AtomicU64,
    total_micros: AtomicU64,
}

/// Point-in-time copy of `OutcomeCounters`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeSnapshot {
    pub processed: u64,
    pub malformed: u64,
    pub validation: u64,
    pub storage: u64,
    pub unexpected: u64,
    pub total_micros: u64,
}

impl OutcomeSnapshot {
    pub fn failed(&self) -> u64 {
        self.malformed + self.validation + self.storage + self.unexpected
    }

    pub fn total(&self) -> u64 {
        self.processed + self.failed()
    }
}

impl OutcomeCounters {
    pub fn snapshot(&self) -> OutcomeSnapshot {
        OutcomeSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            validation: self.validation.load(Ordering::Relaxed),
            storage: self.storage.load(Ordering::Relaxed),
            unexpected: self.unexpected.load(Ordering::Relaxed),
            total_micros: self.total_micros.load(Ordering::Relaxed),
        }
    }
}

impl IngestObserver for OutcomeCounters {
    fn message_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn message_failed(&self, reason: FailureReason) {
        let counter = match reason {
            FailureReason::Malformed => &self.malformed,
            FailureReason::Validation => &self.validation,
            FailureReason::Storage => &self.storage,
            FailureReason::Unexpected => &self.unexpected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn processing_time(&self, elapsed: Duration) {
        self.total_micros.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }
}

/// Forwards to several observers.
pub struct Fanout(pub Vec<std::sync::Arc<dyn IngestObserver>>);

impl IngestObserver for Fanout {
    fn message_processed(&self) {
        self.0.iter().for_each(|o| o.message_processed());
    }

    fn message_failed(&self, reason: FailureReason) {
        self.0.iter().for_each(|o| o.message_failed(reason));
    }

    fn processing_time(&self, elapsed: Duration) {
        self.0.iter().for_each(|o| o.processing_time(elapsed));
    }
}
