/// Pipeline daemon
///
/// Wires the pipeline together and owns its threads:
/// 1. Builds the database pool and verifies the schema on startup
/// 2. Consumes readings on the calling thread, one message at a time
/// 3. Runs alert passes on a scheduler thread at a fixed interval
/// 4. Stops both on SIGINT/SIGTERM, settling the in-flight message first
///
/// The scheduler thread is joined before the pool is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::alert::notify::BrokerNotifier;
use crate::alert::{AlertEngine, AlertError, PassSummary};
use crate::broker::{BrokerConnection, BrokerError, Topology};
use crate::config::{BrokerSettings, PipelineConfig};
use crate::db::{self, DbSetupError};
use crate::ingest::observer::{Fanout, LogObserver, OutcomeCounters, OutcomeSnapshot};
use crate::ingest::IngestionProcessor;
use crate::retry::{RetryPolicy, ThreadSleeper};
use crate::store::pg::PostgresStore;
use crate::store::AlertStore;

/// Longest uninterrupted sleep in the scheduler before re-checking shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// How often the consumer logs its running totals.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which halves of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Full,
    IngestOnly,
    AlertsOnly,
}

impl Mode {
    pub fn runs_ingest(&self) -> bool {
        *self != Mode::AlertsOnly
    }

    pub fn runs_alerts(&self) -> bool {
        *self != Mode::IngestOnly
    }
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("{0}")]
    Database(#[from] DbSetupError),

    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("alert pass failed: {0}")]
    Alert(#[from] AlertError),

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("failed to spawn alert scheduler: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("daemon not initialized")]
    NotInitialized,

    #[error("alert scheduler thread panicked")]
    SchedulerPanicked,
}

// ---------------------------------------------------------------------------
// Alert scheduler
// ---------------------------------------------------------------------------

/// Calls `pass` every `interval`, measured from the start of each pass,
/// until `shutdown` is set. A pass that overruns the interval is followed
/// immediately by the next one; missed ticks are not replayed.
pub fn run_schedule<F: FnMut()>(interval: Duration, shutdown: &AtomicBool, mut pass: F) {
    while !shutdown.load(Ordering::SeqCst) {
        let started = Instant::now();
        pass();
        let next = started + interval;

        loop {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            let now = Instant::now();
            if now >= next {
                break;
            }
            thread::sleep((next - now).min(SHUTDOWN_POLL));
        }
    }
}

/// Background thread running alert passes. The only writer of alerts.
pub struct AlertScheduler {
    handle: JoinHandle<Result<(), DaemonError>>,
}

impl AlertScheduler {
    /// Starts the scheduler. The notifier's broker connection is opened on
    /// the scheduler thread; failing to open it stops the whole daemon.
    pub fn spawn(
        store: Arc<dyn AlertStore>,
        broker: BrokerSettings,
        retry: RetryPolicy,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, DaemonError> {
        let handle = thread::Builder::new()
            .name("alert-scheduler".to_string())
            .spawn(move || {
                let mut engine = match connect_engine(store, &broker, retry) {
                    Ok(engine) => engine,
                    Err(e) => {
                        shutdown.store(true, Ordering::SeqCst);
                        return Err(e);
                    }
                };
                info!(interval_secs = interval.as_secs(), "Alert scheduler started");

                run_schedule(interval, &shutdown, || {
                    if let Err(e) = engine.check_alerts() {
                        error!("Alert pass failed: {}", e);
                    }
                });
                info!("Alert scheduler stopped");
                Ok(())
            })?;
        Ok(Self { handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the current pass to finish and the thread to exit.
    pub fn join(self) -> Result<(), DaemonError> {
        self.handle.join().map_err(|_| DaemonError::SchedulerPanicked)?
    }
}

fn connect_engine(
    store: Arc<dyn AlertStore>,
    broker: &BrokerSettings,
    retry: RetryPolicy,
) -> Result<AlertEngine<BrokerNotifier<BrokerConnection>>, DaemonError> {
    let mut connection = BrokerConnection::new(broker, Topology::publisher(broker), retry);
    connection.connect()?;
    let notifier = BrokerNotifier::new(connection, broker.alert_routing_key.clone());
    Ok(AlertEngine::new(store, notifier))
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

pub struct Daemon {
    config: PipelineConfig,
    mode: Mode,
    shutdown: Arc<AtomicBool>,
    store: Option<Arc<PostgresStore>>,
}

impl Daemon {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            mode: Mode::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            store: None,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Flag that stops the daemon when set.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Connects the pool and verifies the schema.
    pub fn initialize(&mut self) -> Result<(), DaemonError> {
        let pool = db::build_pool(&self.config.database, &self.config.retry.policy(), &ThreadSleeper)?;
        db::verify_schema(&pool)?;
        self.store = Some(Arc::new(PostgresStore::new(pool)));
        Ok(())
    }

    fn store(&self) -> Result<Arc<PostgresStore>, DaemonError> {
        self.store.clone().ok_or(DaemonError::NotInitialized)
    }

    /// Sets the shutdown flag on SIGINT or SIGTERM.
    pub fn install_signal_handler(&self) -> Result<(), DaemonError> {
        let flag = self.shutdown.clone();
        ctrlc::set_handler(move || {
            if !flag.swap(true, Ordering::SeqCst) {
                info!("Shutdown requested, finishing current work");
            }
        })?;
        Ok(())
    }

    /// Runs a single alert pass on the calling thread.
    pub fn run_alert_pass(&self) -> Result<PassSummary, DaemonError> {
        let store: Arc<dyn AlertStore> = self.store()?;
        let mut engine = connect_engine(store, &self.config.broker, self.config.retry.policy())?;
        Ok(engine.check_alerts()?)
    }

    /// Runs until shutdown is requested or a fatal error occurs.
    pub fn run(&mut self) -> Result<(), DaemonError> {
        let store = self.store()?;

        let scheduler = if self.mode.runs_alerts() {
            Some(AlertScheduler::spawn(
                store.clone(),
                self.config.broker.clone(),
                self.config.retry.policy(),
                self.config.check_interval(),
                self.shutdown.clone(),
            )?)
        } else {
            None
        };

        let ingest = if self.mode.runs_ingest() {
            self.run_ingestion(store.clone())
        } else {
            self.wait_for_shutdown(scheduler.as_ref());
            Ok(())
        };

        // whatever ended ingestion also ends the scheduler
        self.shutdown.store(true, Ordering::SeqCst);
        let scheduled = match scheduler {
            Some(scheduler) => scheduler.join(),
            None => Ok(()),
        };

        drop(store);
        self.store = None;
        info!("Daemon stopped");
        ingest.and(scheduled)
    }

    fn wait_for_shutdown(&self, scheduler: Option<&AlertScheduler>) {
        while !self.shutdown.load(Ordering::SeqCst) {
            if scheduler.is_some_and(|s| s.is_finished()) {
                return;
            }
            thread::sleep(SHUTDOWN_POLL);
        }
    }

    fn run_ingestion(&self, store: Arc<PostgresStore>) -> Result<(), DaemonError> {
        let counters = Arc::new(OutcomeCounters::default());
        let observer = Arc::new(Fanout(vec![counters.clone(), Arc::new(LogObserver)]));
        let processor = IngestionProcessor::new(store, observer);

        let broker = &self.config.broker;
        let mut connection = BrokerConnection::new(broker, Topology::consumer(broker), self.config.retry.policy());
        connection.connect()?;

        let mut last_summary = Instant::now();
        let result = connection.run_consumer(&self.shutdown, |payload| {
            let disposition = processor.handle(payload);
            if last_summary.elapsed() >= SUMMARY_INTERVAL {
                log_summary(&counters.snapshot());
                last_summary = Instant::now();
            }
            disposition
        });
        connection.close();
        log_summary(&counters.snapshot());

        if let Err(e) = &result {
            warn!("Consumer stopped with error: {}", e);
        }
        result.map_err(DaemonError::from)
    }
}

fn log_summary(snap: &OutcomeSnapshot) {
    let avg_ms = match snap.total() {
        0 => 0.0,
        n => snap.total_micros as f64 / n as f64 / 1000.0,
    };
    info!(
        processed = snap.processed,
        malformed = snap.malformed,
        invalid = snap.validation,
        storage_failed = snap.storage,
        unexpected = snap.unexpected,
        avg_ms = %format!("{:.2}", avg_ms),
        "Ingestion summary"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
