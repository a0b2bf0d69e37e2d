//! Disk logger daemon (§4.8): drains the log queue and demultiplexes
//! telemetry records from free-form message records, writing each to its
//! own rotating log file. Telemetry records use the vehicle's device name
//! as their tag; message-logger records are tagged with the sentinel
//! `MSG` — this tagging convention is the demultiplexing rule, since the
//! wire format itself (§6) carries no separate record-kind field.
//!
//! Text logs rotate every [`crate::constants::TEXT_LOG_LINES_PER_FILE`]
//! lines; the binary telemetry log rotates every
//! [`crate::constants::BINARY_LOG_BYTES_PER_FILE`] bytes, mirroring the
//! teacher's size-bounded file rotation in its metrics subsystem.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::constants::{BINARY_LOG_BYTES_PER_FILE, TEXT_LOG_LINES_PER_FILE};
use crate::error::GswError;
use crate::mqueue::LogQueue;

const MESSAGE_TAG: &[u8] = b"MSG";

struct Record<'a> {
    sec: u64,
    usec: u32,
    tag: &'a [u8],
    payload: &'a [u8],
}

/// Parses one `[sec.usec]<tag><u32 LE len><payload>` record (§6).
fn parse_record(raw: &[u8]) -> Option<Record<'_>> {
    let open = raw.iter().position(|&b| b == b'[')?;
    let close = raw.iter().position(|&b| b == b']')?;
    let header = std::str::from_utf8(&raw[open + 1..close]).ok()?;
    let (sec_s, usec_s) = header.split_once('.')?;
    let sec: u64 = sec_s.parse().ok()?;
    let usec: u32 = usec_s.parse().ok()?;

    let tag_open = raw[close..].iter().position(|&b| b == b'<')? + close;
    let tag_close = raw[tag_open..].iter().position(|&b| b == b'>')? + tag_open;
    let tag = &raw[tag_open + 1..tag_close];

    let len_start = tag_close + 1;
    let len_bytes: [u8; 4] = raw.get(len_start..len_start + 4)?.try_into().ok()?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let payload_start = len_start + 4;
    let payload = raw.get(payload_start..payload_start + len)?;

    Some(Record { sec, usec, tag, payload })
}

struct RotatingTextLog {
    dir: PathBuf,
    prefix: &'static str,
    file: Option<File>,
    lines_in_file: usize,
    index: usize,
}

impl RotatingTextLog {
    fn new(dir: PathBuf, prefix: &'static str) -> Self {
        Self {
            dir,
            prefix,
            file: None,
            lines_in_file: 0,
            index: 0,
        }
    }

    fn write_line(&mut self, line: &str) -> Result<(), GswError> {
        if self.file.is_none() || self.lines_in_file >= TEXT_LOG_LINES_PER_FILE {
            self.roll()?;
        }
        let file = self.file.as_mut().expect("just rolled");
        writeln!(file, "{line}").map_err(|e| GswError::failure("Logger", "write_line", format!("write failed: {e}")))?;
        self.lines_in_file += 1;
        Ok(())
    }

    fn roll(&mut self) -> Result<(), GswError> {
        let path = self.dir.join(format!("{}.{:06}.log", self.prefix, self.index));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| GswError::failure("Logger", "roll", format!("open '{}' failed: {e}", path.display())))?;
        self.file = Some(file);
        self.lines_in_file = 0;
        self.index += 1;
        Ok(())
    }
}

struct RotatingBinaryLog {
    dir: PathBuf,
    prefix: &'static str,
    file: Option<File>,
    bytes_in_file: u64,
    index: usize,
}

impl RotatingBinaryLog {
    fn new(dir: PathBuf, prefix: &'static str) -> Self {
        Self {
            dir,
            prefix,
            file: None,
            bytes_in_file: 0,
            index: 0,
        }
    }

    fn write_record(&mut self, raw: &[u8]) -> Result<(), GswError> {
        if self.file.is_none() || self.bytes_in_file >= BINARY_LOG_BYTES_PER_FILE {
            self.roll()?;
        }
        let file = self.file.as_mut().expect("just rolled");
        file.write_all(raw).map_err(|e| GswError::failure("Logger", "write_record", format!("write failed: {e}")))?;
        self.bytes_in_file += raw.len() as u64;
        Ok(())
    }

    fn roll(&mut self) -> Result<(), GswError> {
        let path = self.dir.join(format!("{}.{:06}.bin", self.prefix, self.index));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| GswError::failure("Logger", "roll", format!("open '{}' failed: {e}", path.display())))?;
        self.file = Some(file);
        self.bytes_in_file = 0;
        self.index += 1;
        Ok(())
    }
}

/// Consumes a [`LogQueue`] and fans records out to two rotating logs: a
/// human-readable text log for message-logger records, and a binary log
/// for raw telemetry packets.
pub struct Logger {
    queue: LogQueue,
    text_log: RotatingTextLog,
    binary_log: RotatingBinaryLog,
}

impl Logger {
    pub fn init(vehicle_name: &str, log_dir: &Path) -> Result<Self, GswError> {
        std::fs::create_dir_all(log_dir)
            .map_err(|e| GswError::failure("Logger", "init", format!("create_dir_all '{}' failed: {e}", log_dir.display())))?;
        Ok(Self {
            queue: LogQueue::open(vehicle_name)?,
            text_log: RotatingTextLog::new(log_dir.to_path_buf(), "messages"),
            binary_log: RotatingBinaryLog::new(log_dir.to_path_buf(), "telemetry"),
        })
    }

    /// Drains and files every currently-queued record; returns the count
    /// filed. Callers loop this with their own idle-sleep policy.
    pub fn drain_once(&mut self) -> Result<usize, GswError> {
        let mut filed = 0;
        while let Some(raw) = self.queue.receive()? {
            let Some(record) = parse_record(&raw) else {
                warn!("log record failed to parse, dropping");
                continue;
            };
            if record.tag == MESSAGE_TAG {
                let text = String::from_utf8_lossy(record.payload);
                self.text_log.write_line(&format!("[{}.{:06}] {}", record.sec, record.usec, text))?;
            } else {
                self.binary_log.write_record(&raw)?;
            }
            filed += 1;
        }
        if filed > 0 {
            info!(filed, "logger filed records");
        }
        Ok(filed)
    }
}
