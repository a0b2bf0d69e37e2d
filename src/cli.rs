//! Command-line argument shapes for the fabric's binaries (§6).

use clap::Parser;

/// `shmctl -on|-off -f <config>`: creates or destroys a vehicle's shared
/// memory segments.
#[derive(Parser, Debug)]
#[command(name = "shmctl", about = "Create or destroy a vehicle's telemetry shared memory")]
pub struct ShmCtlArgs {
    /// Create every segment for the vehicle.
    #[arg(long = "on", conflicts_with = "off")]
    pub on: bool,

    /// Destroy every segment for the vehicle.
    #[arg(long = "off", conflicts_with = "on")]
    pub off: bool,

    /// Path to the vehicle configuration file.
    #[arg(short = 'f', long = "config")]
    pub config: String,

    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}

/// Shared arguments for the long-running daemon binaries (ingest, uplink,
/// trigger engine, disk logger): all of them just need a config file and a
/// verbosity toggle.
#[derive(Parser, Debug)]
pub struct DaemonArgs {
    /// Path to the vehicle configuration file.
    #[arg(short = 'f', long = "config")]
    pub config: String,

    #[arg(long, default_value_t = false)]
    pub verbose: bool,
}
