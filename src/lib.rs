/// wxmon_service: weather station ingestion and threshold alerting pipeline.
///
/// # Module structure
///
/// ```text
/// wxmon_service
/// ├── model       — shared data types (Reading, ThresholdConfig, Alert, …)
/// ├── config      — pipeline configuration (.env, wxmon.toml, environment)
/// ├── retry       — bounded retry policy with injectable sleeping
/// ├── db          — connection pool construction and schema verification
/// ├── validate    — inbound reading validation and normalization
/// ├── store
/// │   ├── pg      — PostgreSQL reading and alert persistence
/// │   └── memory (test only) — in-memory store with failure injection
/// ├── broker
/// │   └── connection — AMQP connection, topology, consume and publish
/// ├── ingest      — per-message state machine and ack/requeue decisions
/// │   └── observer — ingestion outcome reporting
/// ├── alert       — threshold evaluation and open-alert deduplication
/// │   └── notify  — severity-routed alert notifications
/// └── daemon      — startup, consumer loop, alert scheduler, shutdown
/// ```

/// Public modules
pub mod alert;
pub mod broker;
pub mod config;
pub mod daemon;
pub mod db;
pub mod ingest;
pub mod model;
pub mod retry;
pub mod store;
pub mod validate;
