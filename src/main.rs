//! Weather Station Monitoring Pipeline - Main Daemon
//!
//! A server-side daemon that continuously:
//! 1. Consumes station readings from RabbitMQ
//! 2. Validates and stores them in PostgreSQL
//! 3. Evaluates alert thresholds against the latest reading per station
//! 4. Publishes deduplicated alerts by severity
//!
//! Usage:
//!   cargo run --release                    # Ingestion and alerting
//!   cargo run --release -- --ingest-only   # Ingestion only
//!   cargo run --release -- --alerts-only   # Alert scheduler only
//!   cargo run --release -- --once          # One alert pass, then exit
//!
//! Environment:
//!   DATABASE_URL or POSTGRES_*, RABBITMQ_*, see wxmon.toml.example
//!   RUST_LOG - log filter (default: wxmon_service=info)

use std::env;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wxmon_service::config::PipelineConfig;
use wxmon_service::daemon::{Daemon, Mode};

fn main() {
    println!("🌦  Weather Station Monitoring Pipeline");
    println!("=======================================\n");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wxmon_service=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse command-line arguments
    let args: Vec<String> = env::args().collect();
    let mut mode = Mode::Full;
    let mut once = false;

    for arg in &args[1..] {
        match arg.as_str() {
            "--ingest-only" => mode = Mode::IngestOnly,
            "--alerts-only" => mode = Mode::AlertsOnly,
            "--once" => once = true,
            _ => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Usage: {} [--ingest-only | --alerts-only] [--once]", args[0]);
                std::process::exit(1);
            }
        }
    }

    let config = match PipelineConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\n❌ Configuration error: {}\n", e);
            std::process::exit(1);
        }
    };

    let mut daemon = Daemon::new(config.clone()).with_mode(mode);

    println!("📊 Initializing daemon...");
    if let Err(e) = daemon.initialize() {
        eprintln!("\n❌ Initialization failed: {}\n", e);
        std::process::exit(1);
    }
    println!("✓ Daemon initialized\n");

    if once {
        match daemon.run_alert_pass() {
            Ok(summary) => {
                println!(
                    "✓ Alert pass complete: {} created, {} already open, {} failed configs",
                    summary.alerts_created, summary.duplicates_skipped, summary.configs_failed
                );
                return;
            }
            Err(e) => {
                eprintln!("\n❌ Alert pass failed: {}\n", e);
                std::process::exit(1);
            }
        }
    }

    if let Err(e) = daemon.install_signal_handler() {
        eprintln!("\n❌ {}\n", e);
        std::process::exit(1);
    }

    println!("🔄 Starting pipeline...");
    if mode.runs_ingest() {
        println!("   Consuming {} from exchange {}", config.broker.queue, config.broker.exchange);
    }
    if mode.runs_alerts() {
        println!("   Alert check interval: {} seconds", config.check_interval().as_secs());
    }
    println!("   Press Ctrl+C to stop\n");

    if let Err(e) = daemon.run() {
        eprintln!("\n❌ Daemon error: {}", e);
        std::process::exit(1);
    }
}
