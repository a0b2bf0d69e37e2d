//! Packet Ingest (§4.9): one UDP socket bound per non-virtual packet port.
//! On `recvfrom`, writes the received bytes into the matching TShm slot
//! (or clears it on a size mismatch) and emits a log record. Sockets are
//! `SO_REUSEADDR | SO_REUSEPORT` so multiple ingest instances may coexist
//! during development, grounded on the teacher's `socket2`-based socket
//! construction in its transport layer.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::GswError;
use crate::mqueue::LogQueue;
use crate::tshm::Tshm;
use crate::uplink::DeviceAddrTable;
use crate::vcm::Vcm;

pub struct IngestService {
    vcm: Arc<Vcm>,
    tshm: Arc<Tshm>,
    log_queue: Option<Arc<LogQueue>>,
    addr_table: Arc<DeviceAddrTable>,
}

impl IngestService {
    pub fn new(vcm: Arc<Vcm>, tshm: Arc<Tshm>, log_queue: Option<Arc<LogQueue>>, addr_table: Arc<DeviceAddrTable>) -> Self {
        Self {
            vcm,
            tshm,
            log_queue,
            addr_table,
        }
    }

    /// Runs ingest for every non-virtual packet until `should_stop` returns
    /// true. Each packet's socket loop is its own tokio task.
    pub async fn run(self: Arc<Self>, should_stop: impl Fn() -> bool + Send + Sync + 'static) -> Result<(), GswError> {
        let should_stop = Arc::new(should_stop);
        let mut tasks = Vec::new();
        for packet in self.vcm.packets.iter().filter(|p| !p.is_virtual) {
            let socket = bind_reusable(packet.port)?;
            let svc = Arc::clone(&self);
            let stop = Arc::clone(&should_stop);
            let packet_index = packet.index;
            let packet_size = packet.size;
            let port = packet.port;
            tasks.push(tokio::spawn(async move {
                svc.socket_loop(socket, packet_index, packet_size, port, stop).await;
            }));
        }
        for t in tasks {
            let _ = t.await;
        }
        Ok(())
    }

    async fn socket_loop(
        &self,
        socket: UdpSocket,
        packet_index: usize,
        packet_size: usize,
        port: u16,
        should_stop: Arc<dyn Fn() -> bool + Send + Sync>,
    ) {
        let mut buf = vec![0u8; 65536];
        info!(port, packet_index, "ingest listening");
        loop {
            if should_stop() {
                break;
            }
            let recv = tokio::time::timeout(std::time::Duration::from_millis(500), socket.recv_from(&mut buf)).await;
            let (len, peer) = match recv {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    warn!(port, error = %e, "recvfrom failed");
                    continue;
                }
                Err(_) => continue, // timed out, re-check should_stop
            };

            self.learn_address(peer);

            if len == packet_size {
                if let Err(e) = self.tshm.write(packet_index, &buf[..len], packet_index as u32) {
                    warn!(port, error = %e, "TShm.write failed");
                    continue;
                }
                if let Some(q) = &self.log_queue {
                    if self.tshm.logging_enabled() {
                        if let Err(e) = q.push_telemetry(self.vcm.device.as_bytes(), &buf[..len]) {
                            warn!(port, error = %e, "log record dropped");
                        }
                    }
                }
                debug!(port, len, "packet ingested");
            } else {
                warn!(port, expected = packet_size, got = len, "packet size mismatch, clearing slot");
                let _ = self.tshm.clear(packet_index, packet_index as u32);
            }
        }
    }

    fn learn_address(&self, peer: SocketAddr) {
        // passively learn the sender's address for the default device, per
        // the preserved "refuse to send until learned" behavior in uplink.
        self.addr_table.learn(DeviceAddrTable::DEFAULT_DEVICE, peer);
    }
}

fn bind_reusable(port: u16) -> Result<UdpSocket, GswError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)
        .map_err(|e| GswError::failure("Ingest", "bind", format!("socket() failed: {e}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| GswError::failure("Ingest", "bind", format!("SO_REUSEADDR failed: {e}")))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| GswError::failure("Ingest", "bind", format!("SO_REUSEPORT failed: {e}")))?;
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("valid socket addr");
    socket
        .bind(&addr.into())
        .map_err(|e| GswError::failure("Ingest", "bind", format!("bind({port}) failed: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| GswError::failure("Ingest", "bind", format!("set_nonblocking failed: {e}")))?;
    UdpSocket::from_std(socket.into()).map_err(|e| GswError::failure("Ingest", "bind", format!("tokio UdpSocket::from_std failed: {e}")))
}
