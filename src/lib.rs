//! # GSW Telemetry Fabric
//!
//! A shared-memory telemetry fabric for ground support software: vehicle
//! configuration parsing, a writer-preference shared-memory core with
//! futex-based blocking reads, viewer/writer APIs built on top of it, a
//! static trigger-function engine for derived measurements, and the
//! message-queue-backed ingest/uplink/logging daemons that move packets
//! on and off the wire.

pub mod cli;
pub mod config;
pub mod constants;
pub mod convert;
pub mod error;
pub mod ingest;
pub mod logger;
pub mod logging;
pub mod mqueue;
pub mod shm;
pub mod signal;
pub mod trigger;
pub mod tshm;
pub mod uplink;
pub mod vcm;
pub mod viewer;
pub mod writer;

pub use error::{GswError, Outcome};
pub use vcm::Vcm;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// The current version of the fabric.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wires up the two-layer subscriber every binary in this crate uses: a
/// colorized, metadata-free layer on stdout (via [`logging::ColorizedFormatter`])
/// for user-facing messages, and a full, non-blocking rolling-file layer
/// under `log_dir` for diagnostics. The returned guard must be held for the
/// life of the process — dropping it stops the background flush thread.
pub fn init_tracing(component: &str, log_dir: &std::path::Path, verbose: bool) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::never(log_dir, format!("{component}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let stdout_layer = fmt::layer()
        .event_format(logging::ColorizedFormatter)
        .with_writer(std::io::stdout);
    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
