//! Fixed constants shared across the fabric.

use std::time::Duration;

/// Correct value; the original source computed this as `10^6` using the
/// XOR operator rather than exponentiation, producing wrong timestamps.
pub const NANOSEC_PER_MILLISEC: u64 = 1_000_000;

/// Upper bound on a single measurement's byte size (§4.4).
pub const MAX_CONVERSION_SIZE: usize = 256;

/// `master_nonce == 0` is reserved as the "interrupted" sentinel (invariant 4).
pub const INTERRUPTED_NONCE: u32 = 0;

/// Bounded capacity of the log and uplink message queues (§4.8).
pub const QUEUE_MAX_MESSAGES: i64 = 10;
pub const QUEUE_MAX_MSG_SIZE: i64 = 4096;

/// Disk logger rotation thresholds (§4.8).
pub const TEXT_LOG_LINES_PER_FILE: usize = 512;
pub const BINARY_LOG_BYTES_PER_FILE: u64 = 1 << 31;

/// Default poll granularity used when translating an absolute-deadline
/// timeout into retry loops around semaphore/futex primitives.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tag offsets within the `(path, tag)` shared-segment identity scheme (§4.2).
pub mod tag {
    /// Master block (readers/writers/nonce/semaphores).
    pub const MASTER: i32 = 0;
    /// One-byte "logging enabled" flag segment (§4.8).
    pub const LOGGING_FLAG: i32 = -1;
    /// Per-packet data slot: `DATA_BASE + 3 * packet_index`.
    pub const DATA_BASE: i32 = 1;
    /// Per-packet nonce slot: `INFO_BASE + 3 * packet_index`.
    pub const INFO_BASE: i32 = 2;
    /// Per-virtual-packet write-lock semaphore: `WRITE_LOCK_BASE + 3 * packet_index`.
    pub const WRITE_LOCK_BASE: i32 = 3;
}
