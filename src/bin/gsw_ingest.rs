//! `gsw-ingest`: binds one UDP socket per packet port and writes received
//! packets into the vehicle's telemetry shared memory (§4.9).

use std::sync::Arc;

use clap::Parser;
use gsw_telemetry_fabric::cli::DaemonArgs;
use gsw_telemetry_fabric::ingest::IngestService;
use gsw_telemetry_fabric::mqueue::LogQueue;
use gsw_telemetry_fabric::tshm::Tshm;
use gsw_telemetry_fabric::uplink::DeviceAddrTable;
use gsw_telemetry_fabric::{config, signal, Vcm};

#[tokio::main]
async fn main() {
    let args = DaemonArgs::parse();
    let log_dir = config::log_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
    let _guard = gsw_telemetry_fabric::init_tracing("gsw-ingest", &log_dir, args.verbose);

    let vcm = match Vcm::load(&args.config) {
        Ok(v) => Arc::new(v),
        Err(e) => {
            eprintln!("gsw-ingest: failed to load config '{}': {e}", args.config);
            std::process::exit(-1);
        }
    };

    let anchor = match config::shm_anchor_path(&vcm.device) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("gsw-ingest: {e}");
            std::process::exit(-1);
        }
    };

    let tshm = match Tshm::attach(&vcm, &anchor) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            eprintln!("gsw-ingest: failed to attach to shared memory (did shmctl -on run?): {e}");
            std::process::exit(-1);
        }
    };

    unsafe {
        signal::install(tshm.master_nonce_ptr());
    }

    let log_queue = LogQueue::open(&vcm.device).ok().map(Arc::new);
    let addr_table = Arc::new(DeviceAddrTable::open(&anchor));

    let service = Arc::new(IngestService::new(Arc::clone(&vcm), tshm, log_queue, addr_table));
    if let Err(e) = service.run(signal::is_killed).await {
        eprintln!("gsw-ingest: {e}");
        std::process::exit(-1);
    }

    std::process::exit(0);
}
