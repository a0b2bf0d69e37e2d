//! Uplink (§4.8.2, §4.9): one task per configured `net` device, each
//! draining its named [`crate::mqueue::UplinkQueue`] and sending staged
//! commands to that device's last-known address. A device with no
//! learned address yet refuses to send rather than guessing, preserving
//! `original_source`'s stale-`device_addr` behavior (see DESIGN.md's
//! "Open Questions resolved").
//!
//! Ingest and uplink run as separate processes, so the learned address
//! cannot live in process memory — it is a tiny shared-memory segment per
//! device, one tag past the telemetry segments' own tag space, so a
//! `shmctl -on`-created vehicle and its ingest/uplink daemons agree on it
//! without any additional IPC.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::error::GswError;
use crate::mqueue::UplinkQueue;
use crate::shm::SharedSegment;
use crate::vcm::Vcm;

#[repr(C)]
struct DeviceAddrRaw {
    valid: u32,
    ip: [u8; 4],
    port: u16,
}

/// One shared-memory-backed "last known address" cell per network device,
/// learned passively from inbound telemetry (see [`crate::ingest`]) and
/// read back by the uplink drain loop in a possibly different process.
pub struct DeviceAddrTable {
    anchor: std::path::PathBuf,
}

impl DeviceAddrTable {
    pub const DEFAULT_DEVICE: &'static str = "default";

    /// Uplink device address cells live one tag index above the fabric's
    /// own `(master, data, info, write-lock)` tag space, keyed further by
    /// a stable hash of the device name so any number of devices fit
    /// without growing per-vehicle layout.
    fn tag_for(device: &str) -> i32 {
        const BASE: i32 = 1_000_000;
        let mut hash: u32 = 2166136261;
        for b in device.as_bytes() {
            hash ^= *b as u32;
            hash = hash.wrapping_mul(16777619);
        }
        BASE + (hash % 1_000_000) as i32
    }

    pub fn open(anchor: &Path) -> Self {
        Self { anchor: anchor.to_path_buf() }
    }

    pub fn learn(&self, device: &str, addr: SocketAddr) {
        let SocketAddr::V4(v4) = addr else {
            warn!(device, %addr, "ignoring non-IPv4 uplink source address");
            return;
        };
        let Ok(seg) = SharedSegment::create_or_attach(&self.anchor, Self::tag_for(device), std::mem::size_of::<DeviceAddrRaw>()) else {
            warn!(device, "failed to open device address segment");
            return;
        };
        unsafe {
            let raw = seg.as_ptr() as *mut DeviceAddrRaw;
            std::ptr::write_volatile(&mut (*raw).ip, v4.ip().octets());
            std::ptr::write_volatile(&mut (*raw).port, v4.port());
            std::ptr::write_volatile(&mut (*raw).valid, 1);
        }
    }

    pub fn lookup(&self, device: &str) -> Option<SocketAddr> {
        let seg = SharedSegment::create_or_attach(&self.anchor, Self::tag_for(device), std::mem::size_of::<DeviceAddrRaw>()).ok()?;
        unsafe {
            let raw = seg.as_ptr() as *const DeviceAddrRaw;
            if std::ptr::read_volatile(&(*raw).valid) == 0 {
                return None;
            }
            let ip = std::ptr::read_volatile(&(*raw).ip);
            let port = std::ptr::read_volatile(&(*raw).port);
            Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
        }
    }
}

pub struct UplinkService {
    vcm: Arc<Vcm>,
    addr_table: Arc<DeviceAddrTable>,
}

impl UplinkService {
    pub fn new(vcm: Arc<Vcm>, addr_table: Arc<DeviceAddrTable>) -> Self {
        Self { vcm, addr_table }
    }

    /// Spawns one drain task per configured `net` device and waits for all
    /// of them. Each task polls its queue on a short interval since POSIX
    /// message queues have no async-notify primitive in this crate's stack.
    pub async fn run(self: Arc<Self>, should_stop: impl Fn() -> bool + Send + Sync + 'static) -> Result<(), GswError> {
        let should_stop = Arc::new(should_stop);
        let mut tasks = Vec::new();
        for device in &self.vcm.net_devices {
            let queue = Arc::new(UplinkQueue::open(&device.name)?);
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| GswError::failure("Uplink", "run", format!("bind failed: {e}")))?;
            let device_name = device.name.clone();
            let svc = Arc::clone(&self);
            let stop = Arc::clone(&should_stop);
            tasks.push(tokio::spawn(async move {
                svc.drain_loop(device_name, queue, socket, stop).await;
            }));
        }
        for t in tasks {
            let _ = t.await;
        }
        Ok(())
    }

    async fn drain_loop(&self, device_name: String, queue: Arc<UplinkQueue>, socket: UdpSocket, should_stop: Arc<dyn Fn() -> bool + Send + Sync>) {
        info!(device = %device_name, "uplink drain started");
        loop {
            if should_stop() {
                break;
            }
            match queue.receive() {
                Ok(Some(payload)) => self.send_one(&device_name, &socket, &payload).await,
                Ok(None) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
                Err(e) => {
                    warn!(device = %device_name, error = %e, "uplink receive failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }
    }

    async fn send_one(&self, device_name: &str, socket: &UdpSocket, payload: &[u8]) {
        let Some(addr) = self.addr_table.lookup(device_name).or_else(|| self.addr_table.lookup(DeviceAddrTable::DEFAULT_DEVICE)) else {
            warn!(device = %device_name, "refusing to send: no learned address for device");
            return;
        };
        if let Err(e) = socket.send_to(payload, addr).await {
            warn!(device = %device_name, %addr, error = %e, "sendto failed");
        }
    }
}
