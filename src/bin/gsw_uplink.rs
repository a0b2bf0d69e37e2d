//! `gsw-uplink`: drains each configured network device's uplink queue and
//! sends staged commands to that device's last-known address (§4.8.2).

use std::sync::Arc;

use clap::Parser;
use gsw_telemetry_fabric::cli::DaemonArgs;
use gsw_telemetry_fabric::tshm::Tshm;
use gsw_telemetry_fabric::uplink::{DeviceAddrTable, UplinkService};
use gsw_telemetry_fabric::{config, signal, Vcm};

#[tokio::main]
async fn main() {
    let args = DaemonArgs::parse();
    let log_dir = config::log_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
    let _guard = gsw_telemetry_fabric::init_tracing("gsw-uplink", &log_dir, args.verbose);

    let vcm = match Vcm::load(&args.config) {
        Ok(v) => Arc::new(v),
        Err(e) => {
            eprintln!("gsw-uplink: failed to load config '{}': {e}", args.config);
            std::process::exit(-1);
        }
    };

    let anchor = match config::shm_anchor_path(&vcm.device) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("gsw-uplink: {e}");
            std::process::exit(-1);
        }
    };

    // attach only to confirm the vehicle's shared memory exists and to
    // register the signal escape hatch; the uplink path itself never
    // touches telemetry shm beyond that.
    let tshm = match Tshm::attach(&vcm, &anchor) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("gsw-uplink: failed to attach to shared memory (did shmctl -on run?): {e}");
            std::process::exit(-1);
        }
    };
    unsafe {
        signal::install(tshm.master_nonce_ptr());
    }

    let addr_table = Arc::new(DeviceAddrTable::open(&anchor));
    let service = Arc::new(UplinkService::new(Arc::clone(&vcm), addr_table));
    if let Err(e) = service.run(signal::is_killed).await {
        eprintln!("gsw-uplink: {e}");
        std::process::exit(-1);
    }

    std::process::exit(0);
}
