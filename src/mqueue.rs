//! Message Queues (§4.8): bounded, lossy POSIX message queues used for (a)
//! shipping log records to a logger daemon and (b) staging uplink commands.
//!
//! Generalizes the teacher's `ipc::posix_message_queue` transport (one
//! request/response queue pair) to this system's two independent queue
//! uses, keeping its non-blocking-with-retry send discipline, creator-only
//! unlink, and `Drop` safety net.

use std::os::unix::io::AsRawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::mqueue::{mq_close, mq_open, mq_receive, mq_send, mq_unlink, MQ_OFlag, MqAttr, MqdT};
use nix::sys::stat::Mode;
use tracing::{debug, warn};

use crate::constants::{QUEUE_MAX_MESSAGES, QUEUE_MAX_MSG_SIZE};
use crate::error::GswError;

/// A single named, bounded, lossy POSIX message queue.
struct BoundedQueue {
    name: String,
    fd: Option<MqdT>,
    is_creator: bool,
    max_msg_size: usize,
}

impl BoundedQueue {
    fn create(name: &str) -> Result<Self, GswError> {
        let attr = MqAttr::new(0, QUEUE_MAX_MESSAGES, QUEUE_MAX_MSG_SIZE, 0);
        let fd = mq_open(
            name,
            MQ_OFlag::O_CREAT | MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK,
            Mode::S_IRUSR | Mode::S_IWUSR,
            Some(&attr),
        )
        .map_err(|e| GswError::failure("MessageQueue", "create", format!("mq_open '{name}' failed: {e}")))?;
        debug!(name, fd = fd.as_raw_fd(), "created message queue");
        Ok(Self {
            name: name.to_string(),
            fd: Some(fd),
            is_creator: true,
            max_msg_size: QUEUE_MAX_MSG_SIZE as usize,
        })
    }

    fn open(name: &str) -> Result<Self, GswError> {
        let fd = mq_open(name, MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK, Mode::empty(), None)
            .map_err(|e| GswError::failure("MessageQueue", "open", format!("mq_open '{name}' failed: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            fd: Some(fd),
            is_creator: false,
            max_msg_size: QUEUE_MAX_MSG_SIZE as usize,
        })
    }

    fn open_or_create(name: &str) -> Result<Self, GswError> {
        match Self::open(name) {
            Ok(q) => Ok(q),
            Err(_) => Self::create(name),
        }
    }

    /// Non-blocking send with bounded retries; on a persistently full queue
    /// the message is dropped and the loss is logged (§4.8: "lossy under
    /// pressure").
    fn try_send(&self, payload: &[u8]) -> Result<(), GswError> {
        if payload.len() > self.max_msg_size {
            return Err(GswError::failure("MessageQueue", "send", "payload exceeds max message size"));
        }
        let fd = self.fd.as_ref().ok_or_else(|| GswError::failure("MessageQueue", "send", "queue already closed"))?;
        const RETRIES: u32 = 3;
        for attempt in 0..RETRIES {
            match mq_send(fd, payload, 0) {
                Ok(()) => return Ok(()),
                Err(Errno::EAGAIN) => {
                    if attempt + 1 == RETRIES {
                        warn!(queue = %self.name, "queue full, message dropped");
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_micros(200));
                }
                Err(e) => return Err(GswError::failure("MessageQueue", "send", format!("mq_send failed: {e}"))),
            }
        }
        Ok(())
    }

    /// Non-blocking receive; returns `Ok(None)` rather than blocking when
    /// the queue is empty.
    fn try_receive(&self) -> Result<Option<Vec<u8>>, GswError> {
        let fd = self.fd.as_ref().ok_or_else(|| GswError::failure("MessageQueue", "receive", "queue already closed"))?;
        let mut buf = vec![0u8; self.max_msg_size];
        let mut priority = 0u32;
        match mq_receive(fd, &mut buf, &mut priority) {
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(GswError::failure("MessageQueue", "receive", format!("mq_receive failed: {e}"))),
        }
    }
}

impl Drop for BoundedQueue {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            let _ = mq_close(fd);
        }
        if self.is_creator {
            let _ = mq_unlink(self.name.as_str());
        }
    }
}

/// Log record queue (§4.8.1): producers are packet ingest, virtual-packet
/// flush, and the message logger; the logger daemon is the sole consumer.
pub struct LogQueue {
    queue: BoundedQueue,
}

impl LogQueue {
    pub fn create(vehicle_name: &str) -> Result<Self, GswError> {
        Ok(Self {
            queue: BoundedQueue::create(&format!("/gsw_{vehicle_name}_log")),
        })
    }

    pub fn open(vehicle_name: &str) -> Result<Self, GswError> {
        Ok(Self {
            queue: BoundedQueue::open_or_create(&format!("/gsw_{vehicle_name}_log")),
        })
    }

    /// Pushes a telemetry record: `[sec.usec]<device_tag><u32 LE
    /// len><payload>` (§6).
    pub fn push_telemetry(&self, device_tag: &[u8], payload: &[u8]) -> Result<(), GswError> {
        self.push_record(device_tag, payload)
    }

    /// Pushes a free-form message-logger record using the same framing.
    pub fn push_message(&self, device_tag: &[u8], message: &[u8]) -> Result<(), GswError> {
        self.push_record(device_tag, message)
    }

    fn push_record(&self, device_tag: &[u8], payload: &[u8]) -> Result<(), GswError> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let mut record = Vec::with_capacity(payload.len() + device_tag.len() + 32);
        record.extend_from_slice(format!("[{}.{}]", now.as_secs(), now.subsec_micros()).as_bytes());
        record.push(b'<');
        record.extend_from_slice(device_tag);
        record.push(b'>');
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(payload);
        self.queue.try_send(&record)
    }

    pub fn receive(&self) -> Result<Option<Vec<u8>>, GswError> {
        self.queue.try_receive()
    }
}

/// One uplink command queue per configured network device (§4.8.2).
pub struct UplinkQueue {
    queue: BoundedQueue,
}

impl UplinkQueue {
    pub fn create(device_name: &str) -> Result<Self, GswError> {
        Ok(Self {
            queue: BoundedQueue::create(&format!("/gsw_uplink_{device_name}")),
        })
    }

    pub fn open(device_name: &str) -> Result<Self, GswError> {
        Ok(Self {
            queue: BoundedQueue::open_or_create(&format!("/gsw_uplink_{device_name}")),
        })
    }

    /// Commander-side: stage an up-to-4096-byte command payload.
    pub fn push(&self, payload: &[u8]) -> Result<(), GswError> {
        self.queue.try_send(payload)
    }

    /// Uplink-side: drain one staged command, if any.
    pub fn receive(&self) -> Result<Option<Vec<u8>>, GswError> {
        self.queue.try_receive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_queue_round_trip() {
        let name = format!("rttest{}", std::process::id());
        let q = LogQueue::create(&name).unwrap();
        q.push_telemetry(b"veh", &[1, 2, 3]).unwrap();
        let rec = q.receive().unwrap().expect("a record");
        assert!(rec.windows(4).any(|w| w == b"<veh"));
        assert!(rec.ends_with(&[1, 2, 3]));
    }

    #[test]
    fn uplink_queue_round_trip() {
        let name = format!("uplinktest{}", std::process::id());
        let q = UplinkQueue::create(&name).unwrap();
        q.push(b"FIRE").unwrap();
        assert_eq!(q.receive().unwrap().unwrap(), b"FIRE");
    }
}
