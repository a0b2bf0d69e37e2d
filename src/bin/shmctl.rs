//! `shmctl`: creates or destroys a vehicle's telemetry shared memory.
//! The only binary permitted to call `Tshm::create`/`Tshm::destroy`.

use clap::Parser;
use gsw_telemetry_fabric::cli::ShmCtlArgs;
use gsw_telemetry_fabric::{config, tshm::Tshm, Vcm};

fn main() {
    let args = ShmCtlArgs::parse();
    let log_dir = config::log_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
    let _guard = gsw_telemetry_fabric::init_tracing("shmctl", &log_dir, args.verbose);

    if args.on == args.off {
        eprintln!("shmctl: exactly one of --on or --off is required");
        std::process::exit(-1);
    }

    let vcm = match Vcm::load(&args.config) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("shmctl: failed to load config '{}': {e}", args.config);
            std::process::exit(-1);
        }
    };

    let anchor = match config::shm_anchor_path(&vcm.device) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("shmctl: {e}");
            std::process::exit(-1);
        }
    };
    if let Some(parent) = anchor.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let result = if args.on {
        Tshm::create(&vcm, &anchor).map(|_| ())
    } else {
        Tshm::destroy(&vcm, &anchor)
    };

    match result {
        Ok(()) => {
            tracing::info!(vehicle = %vcm.device, on = args.on, "shmctl completed");
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("shmctl: {e}");
            std::process::exit(-1);
        }
    }
}
