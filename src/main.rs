//! Application entry point for the `sensorhub-ingest` service.
//!
//! This binary orchestrates the full startup sequence for the ingestion
//! pipeline, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Opening the SQLite store and creating the schema if it does not exist
//! - Rehydrating identities and sampling state, starting the worker pool
//! - Connecting to the MQTT broker and subscribing to the sensor topics
//! - Serving the read-only query routes over HTTP
//!
//! Shutdown (SIGINT/SIGTERM) is cooperative: stop intake, drain the
//! pipeline, stop HTTP, close storage, then disconnect from the broker.
//!
//! # Environment Variables
//! See [`sensorhub_ingest::config::load_from_env`] for the full list; the
//! logging knobs are read here:
//! - `SENSORHUB_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `SENSORHUB_SPAN_EVENTS` (optional) – span event mode for tracing
use std::{env, sync::Arc};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tokio::sync::oneshot;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use sensorhub_ingest::{
    broker::{self, BrokerSettings},
    config,
    parser::{Parser, TemperatureBounds},
    pipeline::{self, Ingestor, PipelineStats},
    queue::DeliveryQueue,
    routes::{self, AppState},
    scheduler::{IntervalScheduler, Intervals},
    store::Store,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env().context("invalid configuration")?;
    cfg.log_config();

    tracing::info!("Opening storage: {}", cfg.db_url);
    let store = Store::open_configured(&cfg)
        .await
        .context("invalid configuration")?;
    tracing::info!("Storage ready");

    let stats = Arc::new(PipelineStats::default());
    let parser = Parser::new(
        cfg.topic_prefix(),
        TemperatureBounds {
            min_c: cfg.temp_min_c,
            max_c: cfg.temp_max_c,
        },
    );
    let scheduler = IntervalScheduler::new(
        Intervals {
            testing_secs: cfg.testing_interval_secs,
            normal_secs: cfg.normal_interval_secs,
        },
        cfg.sampling_mode,
    );
    let ingestor = Arc::new(
        Ingestor::open(store.clone(), parser, scheduler, stats.clone())
            .await
            .context("Failed to rehydrate pipeline state")?,
    );

    let queue = Arc::new(DeliveryQueue::new(cfg.queue_capacity));
    let pipeline = pipeline::spawn(ingestor.clone(), queue.clone(), cfg.worker_count);
    let broker = broker::connect(BrokerSettings::from(&cfg), queue, stats);

    let app = routes::router(AppState {
        ingestor,
        link: broker.status(),
    });
    let listener = tokio::net::TcpListener::bind(cfg.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.http_addr))?;
    tracing::info!("Listening on {}", cfg.http_addr);

    let (http_stop, http_stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = http_stopped.await;
            })
            .await
    });

    shutdown_signal().await;

    broker.stop_intake();
    pipeline.drain().await;
    let _ = http_stop.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("HTTP server error: {}", e),
        Err(e) => tracing::error!("HTTP server task failed: {}", e),
    }
    store.close().await;
    broker.disconnect().await;

    tracing::info!("sensorhub-ingest stopped");
    Ok(())
}

// ---

/// Resolve on SIGINT or (on unix) SIGTERM.
async fn shutdown_signal() {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `SENSORHUB_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by `RUST_LOG`, else the `SENSORHUB_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked.
fn init_tracing() {
    // ---
    let span_events = match env::var("SENSORHUB_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to SENSORHUB_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("SENSORHUB_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,rumqttc=info"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
