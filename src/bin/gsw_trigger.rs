//! `gsw-trigger`: runs the trigger engine's event loop (§4.7), recomputing
//! derived "virtual" measurements whenever one of their source packets
//! changes.

use std::sync::Arc;

use clap::Parser;
use gsw_telemetry_fabric::cli::DaemonArgs;
use gsw_telemetry_fabric::mqueue::LogQueue;
use gsw_telemetry_fabric::trigger::TriggerEngine;
use gsw_telemetry_fabric::tshm::Tshm;
use gsw_telemetry_fabric::viewer::Viewer;
use gsw_telemetry_fabric::writer::Writer;
use gsw_telemetry_fabric::{config, error::Outcome, signal, Vcm};

fn main() {
    let args = DaemonArgs::parse();
    let log_dir = config::log_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
    let _guard = gsw_telemetry_fabric::init_tracing("gsw-trigger", &log_dir, args.verbose);

    let config_path = std::path::PathBuf::from(&args.config);
    let config_dir = config_path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| std::path::PathBuf::from("."));

    let vcm = match Vcm::load(&config_path) {
        Ok(v) => Arc::new(v),
        Err(e) => {
            eprintln!("gsw-trigger: failed to load config '{}': {e}", args.config);
            std::process::exit(-1);
        }
    };

    let anchor = match config::shm_anchor_path(&vcm.device) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("gsw-trigger: {e}");
            std::process::exit(-1);
        }
    };

    let tshm = match Tshm::attach(&vcm, &anchor) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            eprintln!("gsw-trigger: failed to attach to shared memory (did shmctl -on run?): {e}");
            std::process::exit(-1);
        }
    };
    unsafe {
        signal::install(tshm.master_nonce_ptr());
    }

    let engine = match TriggerEngine::load(Arc::clone(&vcm), &config_dir) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("gsw-trigger: {e}");
            std::process::exit(-1);
        }
    };

    let log_queue = LogQueue::open(&vcm.device).ok().map(Arc::new);
    let mut viewer = Viewer::init(Arc::clone(&vcm), Arc::clone(&tshm));
    engine.build_viewer(&mut viewer);
    let mut writer = Writer::init(Arc::clone(&vcm), Arc::clone(&tshm), log_queue);

    tracing::info!(vehicle = %vcm.device, "trigger engine running");
    loop {
        if signal::is_killed() {
            break;
        }
        match viewer.update(Some(std::time::Duration::from_millis(500))) {
            Outcome::Success(()) => {
                if let Err(e) = engine.run_cycle(&viewer, &mut writer) {
                    tracing::warn!(error = %e, "trigger cycle failed");
                }
            }
            Outcome::Timeout => continue,
            Outcome::Interrupted => break,
            Outcome::Blocked | Outcome::Locked => continue,
        }
    }

    std::process::exit(0);
}
