//! Telemetry Viewer (§4.5): the high-level read API.
//!
//! Never holds the TShm read lock across user code: [`Viewer::update`]
//! copies changed packet bytes into per-process caches under the lock,
//! releases it, and callers read out of the caches afterward. Grounded on
//! `original_source/include/lib/telemetry/TelemetryViewer.h`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::convert::{convert_from, Value};
use crate::error::Outcome;
use crate::tshm::{ReadMode, Tshm};
use crate::vcm::Vcm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Standard,
    Blocking,
    NonBlocking,
}

impl From<UpdateMode> for ReadMode {
    fn from(m: UpdateMode) -> Self {
        match m {
            UpdateMode::Standard => ReadMode::Standard,
            UpdateMode::Blocking => ReadMode::Blocking,
            UpdateMode::NonBlocking => ReadMode::NonBlocking,
        }
    }
}

pub struct Viewer {
    vcm: Arc<Vcm>,
    tshm: Arc<Tshm>,
    mode: UpdateMode,
    subscribed: HashSet<usize>,
    /// process-local cache of packet bytes, indexed by packet id.
    cache: Vec<Vec<u8>>,
    /// whether each subscribed packet changed at the last `update`.
    updated: Vec<bool>,
}

impl Viewer {
    pub fn init(vcm: Arc<Vcm>, tshm: Arc<Tshm>) -> Self {
        let n = tshm.num_packets();
        let cache = (0..n).map(|i| vec![0u8; tshm.packet_size(i)]).collect();
        Self {
            vcm,
            tshm,
            mode: UpdateMode::Standard,
            subscribed: HashSet::new(),
            cache,
            updated: vec![false; n],
        }
    }

    pub fn set_update_mode(&mut self, mode: UpdateMode) {
        self.mode = mode;
    }

    pub fn add_packet(&mut self, packet_id: usize) {
        self.subscribed.insert(packet_id);
    }

    /// Subscribes to every packet containing `measurement`.
    pub fn add_measurement(&mut self, measurement: &str) -> bool {
        match self.vcm.get_info(measurement) {
            Some(m) => {
                for loc in &m.locations {
                    self.subscribed.insert(loc.packet_index);
                }
                true
            }
            None => {
                warn!(measurement, "Viewer::add: unknown measurement");
                false
            }
        }
    }

    pub fn add_all(&mut self) {
        for i in 0..self.tshm.num_packets() {
            self.subscribed.insert(i);
        }
    }

    pub fn remove_all(&mut self) {
        self.subscribed.clear();
    }

    /// `update(timeout)`. `timeout` of `None` blocks forever in blocking
    /// mode; `Some(Duration::ZERO)` polls once.
    pub fn update(&mut self, timeout: Option<Duration>) -> Outcome<()> {
        if self.subscribed.is_empty() {
            return Outcome::Success(());
        }
        let mut ids: Vec<usize> = self.subscribed.iter().copied().collect();
        ids.sort_unstable();

        let deadline = match self.mode {
            UpdateMode::Blocking => Some(timeout.map(|t| Instant::now() + t).unwrap_or_else(|| Instant::now() + Duration::from_secs(3600 * 24 * 365))),
            _ => None,
        };

        match self.tshm.read_lock(&ids, self.mode.into(), deadline) {
            Outcome::Success(changed) => {
                for (slot, &packet_id) in changed.iter().zip(ids.iter()) {
                    self.updated[packet_id] = *slot;
                    if *slot {
                        // SAFETY: the reader lock is held for the duration of this copy.
                        let buf = unsafe { self.tshm.get_buffer(packet_id) };
                        self.cache[packet_id].copy_from_slice(buf);
                    }
                }
                if let Err(e) = self.tshm.read_unlock(false) {
                    warn!(error = %e, "Viewer::update: read_unlock failed");
                }
                debug!(packets = ?ids, "Viewer updated");
                Outcome::Success(())
            }
            Outcome::Blocked => Outcome::Blocked,
            Outcome::Interrupted => Outcome::Interrupted,
            Outcome::Timeout => Outcome::Timeout,
            Outcome::Locked => Outcome::Locked,
        }
    }

    pub fn updated(&self, measurement: &str) -> bool {
        match self.vcm.get_info(measurement) {
            Some(m) => m.locations.iter().any(|l| self.updated.get(l.packet_index).copied().unwrap_or(false)),
            None => false,
        }
    }

    /// Whether `packet_id` itself changed at the last `update()`, as opposed
    /// to [`Viewer::updated`], which aggregates across every packet a
    /// measurement happens to live in.
    pub fn packet_updated(&self, packet_id: usize) -> bool {
        self.updated.get(packet_id).copied().unwrap_or(false)
    }

    /// Raw bytes at the most recently updated location of `measurement`,
    /// per the §4.3 recency rule.
    pub fn get_raw(&self, measurement: &str) -> Option<&[u8]> {
        let m = self.vcm.get_info(measurement)?;
        let best = self.most_recent_location(m)?;
        let (packet_index, offset) = (best.packet_index, best.offset);
        Some(&self.cache[packet_index][offset..offset + m.size])
    }

    fn most_recent_location<'a>(&self, m: &'a crate::vcm::Measurement) -> Option<&'a crate::vcm::Location> {
        let master = self.tshm.master_nonce();
        m.locations.iter().max_by(|a, b| {
            let na = self.tshm.cached_nonce(a.packet_index);
            let nb = self.tshm.cached_nonce(b.packet_index);
            if self.tshm.more_recent_packet(master, na, nb) {
                std::cmp::Ordering::Greater
            } else if na == nb {
                std::cmp::Ordering::Equal
            } else {
                std::cmp::Ordering::Less
            }
        })
    }

    pub fn get_str(&self, measurement: &str) -> Option<String> {
        let m = self.vcm.get_info(measurement)?;
        let raw = self.get_raw(measurement)?;
        match convert_from(self.vcm.system_endianness, raw, m).ok()? {
            Value::Str(s) => Some(s),
            other => Some(format!("{other:?}")),
        }
    }

    pub fn get_int(&self, measurement: &str) -> Option<i64> {
        let m = self.vcm.get_info(measurement)?;
        let raw = self.get_raw(measurement)?;
        match convert_from(self.vcm.system_endianness, raw, m).ok()? {
            Value::Int(v) => Some(v),
            Value::UInt(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn get_uint(&self, measurement: &str) -> Option<u64> {
        let m = self.vcm.get_info(measurement)?;
        let raw = self.get_raw(measurement)?;
        match convert_from(self.vcm.system_endianness, raw, m).ok()? {
            Value::UInt(v) => Some(v),
            Value::Int(v) => Some(v as u64),
            _ => None,
        }
    }

    pub fn get_float(&self, measurement: &str) -> Option<f64> {
        let m = self.vcm.get_info(measurement)?;
        let raw = self.get_raw(measurement)?;
        match convert_from(self.vcm.system_endianness, raw, m).ok()? {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    /// Delegates to TShm's signal escape hatch.
    pub fn sighandler(&self) {
        unsafe { self.tshm.sighandler() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn setup(name: &str) -> (Arc<Vcm>, Arc<Tshm>, PathBuf) {
        let cfg = format!(
            "protocol = udp\nname = {name}\nA 4 int little unsigned\n8081 {{\n  A\n}}\n"
        );
        let vcm = Arc::new(Vcm::parse(&cfg, PathBuf::from(".")).unwrap());
        let anchor = PathBuf::from(format!("/tmp/gsw-viewer-test-{name}-{}", std::process::id()));
        let tshm = Arc::new(Tshm::create(&vcm, &anchor).unwrap());
        (vcm, tshm, anchor)
    }

    #[test]
    fn update_then_get_uint() {
        let (vcm, tshm, _anchor) = setup("viewer-basic");
        tshm.write(0, &[1, 0, 0, 0], 0).unwrap();

        let mut viewer = Viewer::init(vcm, tshm);
        viewer.add_measurement("A");
        match viewer.update(None) {
            Outcome::Success(()) => {}
            _ => panic!("expected success"),
        }
        assert_eq!(viewer.get_uint("A"), Some(1));
        assert!(viewer.updated("A"));
    }
}
