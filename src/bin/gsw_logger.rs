//! `gsw-logger`: drains the vehicle's log queue to rotating disk files
//! (§4.8). Exits promptly on signal; otherwise polls the queue forever.

use clap::Parser;
use gsw_telemetry_fabric::cli::DaemonArgs;
use gsw_telemetry_fabric::logger::Logger;
use gsw_telemetry_fabric::tshm::Tshm;
use gsw_telemetry_fabric::{config, signal, Vcm};

fn main() {
    let args = DaemonArgs::parse();
    let log_dir = config::log_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
    let _guard = gsw_telemetry_fabric::init_tracing("gsw-logger", &log_dir, args.verbose);

    let vcm = match Vcm::load(&args.config) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("gsw-logger: failed to load config '{}': {e}", args.config);
            std::process::exit(-1);
        }
    };

    let anchor = match config::shm_anchor_path(&vcm.device) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("gsw-logger: {e}");
            std::process::exit(-1);
        }
    };
    let tshm = match Tshm::attach(&vcm, &anchor) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("gsw-logger: failed to attach to shared memory (did shmctl -on run?): {e}");
            std::process::exit(-1);
        }
    };
    unsafe {
        signal::install(tshm.master_nonce_ptr());
    }

    let mut logger = match Logger::init(&vcm.device, &log_dir) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("gsw-logger: {e}");
            std::process::exit(-1);
        }
    };

    tracing::info!(vehicle = %vcm.device, "disk logger running");
    while !signal::is_killed() {
        if !tshm.logging_enabled() {
            std::thread::sleep(std::time::Duration::from_millis(200));
            continue;
        }
        match logger.drain_once() {
            Ok(0) => std::thread::sleep(std::time::Duration::from_millis(50)),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "log drain failed");
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
        }
    }

    std::process::exit(0);
}
