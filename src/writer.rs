//! Telemetry Writer (§4.6): the write path for derived ("virtual")
//! measurements. Grounded on
//! `original_source/include/lib/telemetry/TelemetryWriter.h`, minus the
//! C++-only `boost::interprocess::offset_ptr` detail (a plain `Arc<Tshm>`
//! here serves the same purpose).

use std::sync::Arc;

use tracing::warn;

use crate::convert::{convert_from, convert_to, Value};
use crate::error::GswError;
use crate::mqueue::LogQueue;
use crate::tshm::{ReadMode, Tshm};
use crate::vcm::{Measurement, Vcm};

pub struct Writer {
    vcm: Arc<Vcm>,
    tshm: Arc<Tshm>,
    log_queue: Option<Arc<LogQueue>>,
    virtual_packets: Vec<usize>,
    /// per-virtual-packet scratch buffer, indexed by position in `virtual_packets`.
    scratch: Vec<Vec<u8>>,
    /// whether each virtual packet has a staged, unflushed write.
    staged: Vec<bool>,
    locked: bool,
}

impl Writer {
    pub fn init(vcm: Arc<Vcm>, tshm: Arc<Tshm>, log_queue: Option<Arc<LogQueue>>) -> Self {
        let virtual_packets: Vec<usize> = vcm.packets.iter().filter(|p| p.is_virtual).map(|p| p.index).collect();
        let scratch = virtual_packets.iter().map(|&i| vec![0u8; tshm.packet_size(i)]).collect();
        let staged = vec![false; virtual_packets.len()];
        Self {
            vcm,
            tshm,
            log_queue,
            virtual_packets,
            scratch,
            staged,
            locked: false,
        }
    }

    fn position(&self, packet_id: usize) -> Option<usize> {
        self.virtual_packets.iter().position(|&p| p == packet_id)
    }

    /// Acquires every virtual packet's write-lock semaphore. If
    /// `check_for_updates`, copies the current shm contents into each
    /// scratch buffer first so staged writes don't clobber another
    /// writer's field; per the deadlock analysis in §5, write-locks are
    /// acquired in ascending packet index, strictly before the inner
    /// master lock that `TShm::write`/`read_lock` take.
    pub fn lock(&mut self, check_for_updates: bool) -> Result<(), GswError> {
        for &packet_id in &self.virtual_packets {
            self.tshm.write_lock(packet_id)?;
        }
        self.locked = true;

        if check_for_updates {
            let ids = self.virtual_packets.clone();
            if let crate::error::Outcome::Success(_) = self.tshm.read_lock(&ids, ReadMode::Standard, None) {
                for (pos, &packet_id) in self.virtual_packets.iter().enumerate() {
                    let buf = unsafe { self.tshm.get_buffer(packet_id) };
                    self.scratch[pos].copy_from_slice(buf);
                }
                let _ = self.tshm.read_unlock(false);
            }
        }
        Ok(())
    }

    pub fn unlock(&mut self) -> Result<(), GswError> {
        for &packet_id in &self.virtual_packets {
            self.tshm.write_unlock(packet_id)?;
        }
        self.locked = false;
        Ok(())
    }

    /// Stages `bytes` into every virtual-packet location of `measurement`,
    /// converting endianness. `len` must equal `measurement.size`.
    pub fn write(&mut self, measurement: &str, bytes: &[u8]) -> Result<(), GswError> {
        self.write_inner(measurement, bytes, true)
    }

    /// Byte-identical variant: does not convert endianness.
    pub fn write_raw(&mut self, measurement: &str, bytes: &[u8]) -> Result<(), GswError> {
        self.write_inner(measurement, bytes, false)
    }

    /// Encodes `value` per `measurement`'s own declared size/type/sign and
    /// stages it, for callers (trigger functions) that compute a typed
    /// result rather than already wire-sized bytes. `convert_to` already
    /// produces final, endianness-adjusted bytes, so this stages them
    /// via `write_raw` rather than `write` (which would convert again).
    pub fn write_value(&mut self, measurement: &str, value: Value) -> Result<(), GswError> {
        let meas: Measurement = self
            .vcm
            .get_info(measurement)
            .cloned()
            .ok_or_else(|| GswError::failure("Writer", "write_value", format!("unknown measurement '{measurement}'")))?;
        let encoded = convert_to(self.vcm.system_endianness, &value, &meas)?;
        self.write_raw(measurement, &encoded)
    }

    fn write_inner(&mut self, measurement: &str, bytes: &[u8], convert: bool) -> Result<(), GswError> {
        if !self.locked {
            return Err(GswError::failure("Writer", "write", "must hold write lock"));
        }
        let meas: Measurement = self
            .vcm
            .get_info(measurement)
            .cloned()
            .ok_or_else(|| GswError::failure("Writer", "write", format!("unknown measurement '{measurement}'")))?;
        if convert && bytes.len() != meas.size {
            return Err(GswError::failure("Writer", "write", "length does not match measurement size"));
        }
        if !convert && bytes.len() > meas.size {
            return Err(GswError::failure("Writer", "write_raw", "length exceeds measurement size"));
        }

        let mut wrote_any = false;
        for loc in &meas.locations {
            let Some(pos) = self.position(loc.packet_index) else {
                continue; // not a virtual-packet location; writer only targets virtual packets
            };
            let encoded = if convert {
                convert_to(self.vcm.system_endianness, &Value::Raw(bytes.to_vec()), &meas)?
            } else {
                let mut buf = vec![0u8; meas.size];
                let n = bytes.len().min(meas.size);
                buf[..n].copy_from_slice(&bytes[..n]);
                buf
            };
            self.scratch[pos][loc.offset..loc.offset + meas.size].copy_from_slice(&encoded);
            self.staged[pos] = true;
            wrote_any = true;
        }

        if !wrote_any {
            return Err(GswError::failure("Writer", "write", format!("'{measurement}' has no virtual-packet location")));
        }
        Ok(())
    }

    /// Reads back a staged (not-yet-flushed) value, used by trigger
    /// functions that both read and write virtual measurements in one
    /// cycle (e.g. a rolling average reading its own running mean).
    pub fn read_staged(&self, measurement: &str) -> Option<Value> {
        let meas = self.vcm.get_info(measurement)?;
        let loc = meas.locations.iter().find(|l| self.position(l.packet_index).is_some())?;
        let pos = self.position(loc.packet_index)?;
        let raw = &self.scratch[pos][loc.offset..loc.offset + meas.size];
        convert_from(self.vcm.system_endianness, raw, meas).ok()
    }

    /// `flush()`: for each staged virtual packet, emit a log record then
    /// commit to shared memory.
    pub fn flush(&mut self) -> Result<(), GswError> {
        for (pos, &packet_id) in self.virtual_packets.clone().iter().enumerate() {
            if !self.staged[pos] {
                continue;
            }
            let bytes = self.scratch[pos].clone();
            if let Some(queue) = &self.log_queue {
                if self.tshm.logging_enabled() {
                    if let Err(e) = queue.push_telemetry(self.vcm.device.as_bytes(), &bytes) {
                        warn!(error = %e, packet_id, "Writer::flush: log record dropped");
                    }
                }
            }
            self.tshm.write(packet_id, &bytes, packet_id as u32)?;
            self.staged[pos] = false;
        }
        Ok(())
    }
}
