//! Telemetry Shared Memory (§4.3) — the core of the core.
//!
//! Owns `(2N + 1)` shared segments for a vehicle with `N` packets: one
//! master block, and per packet a data slot plus a 4-byte nonce slot.
//! Virtual packets additionally get a write-lock semaphore segment.
//!
//! The writer-preference protocol (`P`/`V` on `rmutex`/`wmutex`/`read_try`/
//! `resource`) is a direct port of `original_source/lib/shm/src/shm.cpp`;
//! the blocking read path adds the futex-bitset wait described in §4.3
//! on top of that port's plain `FUTEX_WAIT`/`FUTEX_WAKE`.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicPtr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::constants::{tag, INTERRUPTED_NONCE};
use crate::error::{GswError, Outcome};
use crate::shm::SharedSegment;
use crate::vcm::Vcm;

/// Shared layout of the master block (mirrors `shm_info_t` in
/// `TelemetryShm.h`, plus a `last_write_id` tag from `shm.cpp`'s
/// `write_id` parameter).
#[repr(C)]
struct MasterBlockRaw {
    master_nonce: u32,
    readers: u32,
    writers: u32,
    last_write_id: u32,
    rmutex: libc::sem_t,
    wmutex: libc::sem_t,
    read_try: libc::sem_t,
    resource: libc::sem_t,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Never blocks; always returns the current snapshot.
    Standard,
    /// Blocks until at least one requested packet changed.
    Blocking,
    /// Returns `Blocked` immediately if nothing changed.
    NonBlocking,
}

pub struct Tshm {
    num_packets: usize,
    master_seg: SharedSegment,
    data_segs: Vec<SharedSegment>,
    info_segs: Vec<SharedSegment>,
    write_lock_segs: Vec<Option<SharedSegment>>,
    packet_sizes: Vec<usize>,
    /// One-byte "logging enabled" flag (§4.8), attached once at
    /// create/attach time so producers can cheaply check it before every
    /// log-queue push instead of re-opening the segment each time.
    logging_flag_seg: SharedSegment,
    /// Per-instance (process-private) cache of last-observed nonces, per
    /// `original_source`'s `last_nonce`: lives in the attaching process, not
    /// in shared memory.
    last_nonce: Mutex<Vec<u32>>,
    /// Whether this instance currently holds the reader lock (set by
    /// `read_lock` on success, cleared by `read_unlock`).
    read_locked: Mutex<bool>,
}

unsafe impl Send for Tshm {}
unsafe impl Sync for Tshm {}

fn master_size() -> usize {
    std::mem::size_of::<MasterBlockRaw>()
}

impl Tshm {
    /// Create every segment for a vehicle. Only `shmctl -on` should call
    /// this.
    pub fn create(vcm: &Vcm, anchor: &Path) -> Result<Self, GswError> {
        let num_packets = vcm.num_packets();
        let master_seg = SharedSegment::create(anchor, tag::MASTER, master_size())?;
        init_master(&master_seg)?;

        let mut data_segs = Vec::with_capacity(num_packets);
        let mut info_segs = Vec::with_capacity(num_packets);
        let mut write_lock_segs = Vec::with_capacity(num_packets);
        let mut packet_sizes = Vec::with_capacity(num_packets);

        for packet in &vcm.packets {
            let i = packet.index as i32;
            let data = SharedSegment::create(anchor, tag::DATA_BASE + 3 * i, packet.size.max(1))?;
            let info = SharedSegment::create(anchor, tag::INFO_BASE + 3 * i, 4)?;
            unsafe {
                std::ptr::write_volatile(info.as_ptr() as *mut u32, 0);
            }
            let wl = if packet.is_virtual {
                let seg = SharedSegment::create(anchor, tag::WRITE_LOCK_BASE + 3 * i, std::mem::size_of::<libc::sem_t>())?;
                init_sem(seg.as_ptr() as *mut libc::sem_t, 1)?;
                Some(seg)
            } else {
                None
            };

            data_segs.push(data);
            info_segs.push(info);
            write_lock_segs.push(wl);
            packet_sizes.push(packet.size);
        }

        // logging-enabled flag segment (§4.8), defaults to enabled.
        let logging_flag_seg = SharedSegment::create(anchor, tag::LOGGING_FLAG, 1)?;
        unsafe {
            *logging_flag_seg.as_ptr() = 1;
        }

        Ok(Self {
            num_packets,
            master_seg,
            data_segs,
            info_segs,
            write_lock_segs,
            packet_sizes,
            logging_flag_seg,
            last_nonce: Mutex::new(vec![0; num_packets]),
            read_locked: Mutex::new(false),
        })
    }

    /// Attach to an already-created vehicle's segments.
    pub fn attach(vcm: &Vcm, anchor: &Path) -> Result<Self, GswError> {
        let num_packets = vcm.num_packets();
        let master_seg = SharedSegment::attach(anchor, tag::MASTER, master_size())?;

        let mut data_segs = Vec::with_capacity(num_packets);
        let mut info_segs = Vec::with_capacity(num_packets);
        let mut write_lock_segs = Vec::with_capacity(num_packets);
        let mut packet_sizes = Vec::with_capacity(num_packets);

        for packet in &vcm.packets {
            let i = packet.index as i32;
            data_segs.push(SharedSegment::attach(anchor, tag::DATA_BASE + 3 * i, packet.size.max(1))?);
            info_segs.push(SharedSegment::attach(anchor, tag::INFO_BASE + 3 * i, 4)?);
            write_lock_segs.push(if packet.is_virtual {
                Some(SharedSegment::attach(anchor, tag::WRITE_LOCK_BASE + 3 * i, std::mem::size_of::<libc::sem_t>())?)
            } else {
                None
            });
            packet_sizes.push(packet.size);
        }

        let logging_flag_seg = SharedSegment::attach(anchor, tag::LOGGING_FLAG, 1)?;

        Ok(Self {
            num_packets,
            master_seg,
            data_segs,
            info_segs,
            write_lock_segs,
            packet_sizes,
            logging_flag_seg,
            last_nonce: Mutex::new(vec![0; num_packets]),
            read_locked: Mutex::new(false),
        })
    }

    /// Destroy every segment for a vehicle. Only `shmctl -off` should call
    /// this.
    pub fn destroy(vcm: &Vcm, anchor: &Path) -> Result<(), GswError> {
        let tshm = Self::attach(vcm, anchor)?;
        unsafe {
            let m = tshm.master();
            destroy_sem(&mut (*m).rmutex);
            destroy_sem(&mut (*m).wmutex);
            destroy_sem(&mut (*m).read_try);
            destroy_sem(&mut (*m).resource);
        }
        for wl in &tshm.write_lock_segs {
            if let Some(seg) = wl {
                unsafe { destroy_sem(seg.as_ptr() as *mut libc::sem_t) };
            }
        }
        tshm.logging_flag_seg.destroy();
        tshm.master_seg.destroy();
        for seg in tshm.data_segs {
            seg.destroy();
        }
        for seg in tshm.info_segs {
            seg.destroy();
        }
        for seg in tshm.write_lock_segs.into_iter().flatten() {
            seg.destroy();
        }
        Ok(())
    }

    fn master(&self) -> *mut MasterBlockRaw {
        self.master_seg.as_ptr() as *mut MasterBlockRaw
    }

    /// Register this instance's master block for signal-driven eviction.
    /// See [`crate::signal`].
    pub fn master_nonce_ptr(&self) -> *mut u32 {
        self.master() as *mut u32
    }

    pub fn num_packets(&self) -> usize {
        self.num_packets
    }

    pub fn packet_size(&self, packet_id: usize) -> usize {
        self.packet_sizes[packet_id]
    }

    /// `write(packet_id, bytes)` (§4.3).
    pub fn write(&self, packet_id: usize, bytes: &[u8], write_id: u32) -> Result<(), GswError> {
        if packet_id >= self.num_packets {
            return Err(GswError::failure("TShm", "write", "packet index out of range"));
        }
        if bytes.len() != self.packet_sizes[packet_id] {
            return Err(GswError::failure(
                "TShm",
                "write",
                format!(
                    "length {} does not match declared packet size {}",
                    bytes.len(),
                    self.packet_sizes[packet_id]
                ),
            ));
        }

        let m = self.master();
        unsafe {
            writer_enter(m)?;

            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_segs[packet_id].as_ptr(), bytes.len());

            let new_nonce = std::ptr::read_volatile(&(*m).master_nonce).wrapping_add(1);
            std::ptr::write_volatile(&mut (*m).master_nonce, new_nonce);
            std::ptr::write_volatile(&mut (*m).last_write_id, write_id);
            std::ptr::write_volatile(self.info_segs[packet_id].as_ptr() as *mut u32, new_nonce);

            let mask = 1u32 << (packet_id % 32);
            futex_wake_bitset(&mut (*m).master_nonce, mask);

            writer_exit(m)?;
        }
        Ok(())
    }

    /// `clear` (mirrors `write`, but zero-fills instead of copying a buffer).
    pub fn clear(&self, packet_id: usize, write_id: u32) -> Result<(), GswError> {
        let size = self.packet_sizes[packet_id];
        let zeros = vec![0u8; size];
        self.write(packet_id, &zeros, write_id)
    }

    /// `read_lock(packet_ids, mode, timeout)`. On `Outcome::Success`, the
    /// reader lock is held and the caller must follow up with
    /// [`Tshm::read_unlock`] after copying whatever packet data it needs via
    /// [`Tshm::get_buffer`]. On any other outcome the lock has already been
    /// released.
    pub fn read_lock(
        &self,
        packet_ids: &[usize],
        mode: ReadMode,
        deadline: Option<Instant>,
    ) -> Outcome<Vec<bool>> {
        let m = self.master();
        loop {
            if unsafe { reader_enter(m) }.is_err() {
                return Outcome::Interrupted;
            }

            let current_master = unsafe { std::ptr::read_volatile(&(*m).master_nonce) };
            if current_master == INTERRUPTED_NONCE {
                let _ = unsafe { reader_exit(m) };
                return Outcome::Interrupted;
            }

            let mut cache = self.last_nonce.lock().unwrap();
            let mut changed = Vec::with_capacity(packet_ids.len());
            let mut any_changed = false;
            for &i in packet_ids {
                let n = unsafe { std::ptr::read_volatile(self.info_segs[i].as_ptr() as *const u32) };
                if n != cache[i] {
                    cache[i] = n;
                    changed.push(true);
                    any_changed = true;
                } else {
                    changed.push(false);
                }
            }
            drop(cache);

            if any_changed || mode == ReadMode::Standard {
                *self.read_locked.lock().unwrap() = true;
                return Outcome::Success(changed);
            }

            // nothing changed: must not hold the lock while sleeping.
            if unsafe { reader_exit(m) }.is_err() {
                return Outcome::Interrupted;
            }

            match mode {
                ReadMode::NonBlocking => return Outcome::Blocked,
                ReadMode::Standard => unreachable!(),
                ReadMode::Blocking => {
                    let bitset = packet_ids.iter().fold(0u32, |acc, &i| acc | (1u32 << (i % 32)));
                    match futex_wait_bitset(&(*m).master_nonce as *const u32 as *mut u32, current_master, bitset, deadline) {
                        FutexWaitResult::Woken | FutexWaitResult::SpuriousOrChanged => continue,
                        FutexWaitResult::TimedOut => return Outcome::Timeout,
                    }
                }
            }
        }
    }

    /// `read_unlock(force)`. `force` allows releasing a lock this instance
    /// did not believe it held (used by the escape hatch's cleanup path);
    /// ordinary callers pass `false`.
    pub fn read_unlock(&self, force: bool) -> Result<(), GswError> {
        let mut held = self.read_locked.lock().unwrap();
        if !*held && !force {
            return Err(GswError::failure("TShm", "read_unlock", "no read lock held"));
        }
        *held = false;
        drop(held);
        unsafe { reader_exit(self.master()) }
    }

    /// Raw view into a packet's data slot. Only valid while the reader lock
    /// is held (between a successful `read_lock` and `read_unlock`).
    ///
    /// # Safety
    /// The caller must not retain the slice past the matching `read_unlock`.
    pub unsafe fn get_buffer(&self, packet_id: usize) -> &[u8] {
        std::slice::from_raw_parts(self.data_segs[packet_id].as_ptr(), self.packet_sizes[packet_id])
    }

    /// Whether packet `i` is more recently written than packet `j`, given
    /// both nonces were sampled under the same read lock (§4.3 recency rule).
    pub fn more_recent_packet(&self, master_nonce: u32, nonce_i: u32, nonce_j: u32) -> bool {
        master_nonce.wrapping_sub(nonce_j) > master_nonce.wrapping_sub(nonce_i)
    }

    /// This instance's process-private cached nonce for `packet_id`, as
    /// last observed by `read_lock`. Used by [`crate::viewer::Viewer`] to
    /// rank locations of a shared measurement by recency.
    pub fn cached_nonce(&self, packet_id: usize) -> u32 {
        self.last_nonce.lock().unwrap()[packet_id]
    }

    /// Current value of the master nonce. Safe to call at any time; used
    /// only for *relative* recency comparisons, so a value sampled slightly
    /// in the future of some other read does not change the ranking.
    pub fn master_nonce(&self) -> u32 {
        unsafe { std::ptr::read_volatile(&(*self.master()).master_nonce) }
    }

    pub fn last_write_id(&self) -> u32 {
        unsafe { std::ptr::read_volatile(&(*self.master()).last_write_id) }
    }

    /// `write_lock(packet_id)` — serializes producers into the same virtual
    /// packet; does not gate readers.
    pub fn write_lock(&self, packet_id: usize) -> Result<(), GswError> {
        let seg = self.write_lock_segs[packet_id]
            .as_ref()
            .ok_or_else(|| GswError::failure("TShm", "write_lock", "packet is not virtual"))?;
        p(seg.as_ptr() as *mut libc::sem_t)
    }

    pub fn write_unlock(&self, packet_id: usize) -> Result<(), GswError> {
        let seg = self.write_lock_segs[packet_id]
            .as_ref()
            .ok_or_else(|| GswError::failure("TShm", "write_unlock", "packet is not virtual"))?;
        v(seg.as_ptr() as *mut libc::sem_t)
    }

    /// Whether the §4.8 logging-enabled flag is currently set. Checked by
    /// producers (`ingest`, `writer`) before every log-queue push, and by
    /// `gsw-logger` before draining the queue.
    pub fn logging_enabled(&self) -> bool {
        unsafe { *self.logging_flag_seg.as_ptr() != 0 }
    }

    /// Signal escape hatch (§4.3, §9): remap the master block's memory page
    /// to anonymous zeroed memory so any futex wait on `master_nonce`
    /// observes 0 on its next retry and returns "interrupted".
    ///
    /// # Safety
    /// Calls `mmap` with `MAP_FIXED`, which is async-signal-safe but
    /// destructive: after this call, this process's view of the master
    /// block is permanently a private zero page. Must only be invoked as
    /// part of an unconditional process-teardown path (see [`crate::signal`]).
    pub unsafe fn sighandler(&self) {
        sighandler_raw(self.master_nonce_ptr());
    }
}

/// Free-function form of the escape hatch, usable from a raw signal handler
/// without going through `&self` (see [`crate::signal::install`]).
///
/// # Safety
/// `nonce_ptr` must point at the live `master_nonce` field of an attached
/// master block segment.
pub unsafe fn sighandler_raw(nonce_ptr: *mut u32) {
    let page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
    let aligned = (nonce_ptr as usize) & !(page_size - 1);
    libc::mmap(
        aligned as *mut libc::c_void,
        page_size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_FIXED | libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
        -1,
        0,
    );
}

/// Global slot used so an OS signal handler (which cannot capture state)
/// can find the current process's master-block pointer. Set by
/// [`crate::signal::install`].
pub static SIGNAL_TARGET: AtomicPtr<u32> = AtomicPtr::new(std::ptr::null_mut());

fn init_master(seg: &SharedSegment) -> Result<(), GswError> {
    unsafe {
        let m = seg.as_ptr() as *mut MasterBlockRaw;
        std::ptr::write_volatile(&mut (*m).master_nonce, 0);
        std::ptr::write_volatile(&mut (*m).readers, 0);
        std::ptr::write_volatile(&mut (*m).writers, 0);
        std::ptr::write_volatile(&mut (*m).last_write_id, 0);
        init_sem(&mut (*m).rmutex, 1)?;
        init_sem(&mut (*m).wmutex, 1)?;
        init_sem(&mut (*m).read_try, 1)?;
        init_sem(&mut (*m).resource, 1)?;
    }
    Ok(())
}

fn init_sem(sem: *mut libc::sem_t, value: u32) -> Result<(), GswError> {
    let rc = unsafe { libc::sem_init(sem, 1, value) };
    if rc != 0 {
        return Err(GswError::failure("TShm", "init_sem", "sem_init failed"));
    }
    Ok(())
}

unsafe fn destroy_sem(sem: *mut libc::sem_t) {
    if libc::sem_destroy(sem) != 0 {
        warn!("sem_destroy failed");
    }
}

fn p(sem: *mut libc::sem_t) -> Result<(), GswError> {
    if unsafe { libc::sem_wait(sem) } != 0 {
        return Err(GswError::failure("TShm", "p", "sem_wait failed"));
    }
    Ok(())
}

fn v(sem: *mut libc::sem_t) -> Result<(), GswError> {
    if unsafe { libc::sem_post(sem) } != 0 {
        return Err(GswError::failure("TShm", "v", "sem_post failed"));
    }
    Ok(())
}

unsafe fn reader_enter(m: *mut MasterBlockRaw) -> Result<(), GswError> {
    p(&mut (*m).read_try)?;
    p(&mut (*m).rmutex)?;
    (*m).readers += 1;
    if (*m).readers == 1 {
        p(&mut (*m).resource)?;
    }
    v(&mut (*m).rmutex)?;
    v(&mut (*m).read_try)?;
    Ok(())
}

unsafe fn reader_exit(m: *mut MasterBlockRaw) -> Result<(), GswError> {
    p(&mut (*m).rmutex)?;
    (*m).readers -= 1;
    if (*m).readers == 0 {
        v(&mut (*m).resource)?;
    }
    v(&mut (*m).rmutex)?;
    Ok(())
}

unsafe fn writer_enter(m: *mut MasterBlockRaw) -> Result<(), GswError> {
    p(&mut (*m).wmutex)?;
    (*m).writers += 1;
    if (*m).writers == 1 {
        p(&mut (*m).read_try)?;
    }
    v(&mut (*m).wmutex)?;
    p(&mut (*m).resource)?;
    Ok(())
}

unsafe fn writer_exit(m: *mut MasterBlockRaw) -> Result<(), GswError> {
    v(&mut (*m).resource)?;
    p(&mut (*m).wmutex)?;
    (*m).writers -= 1;
    if (*m).writers == 0 {
        v(&mut (*m).read_try)?;
    }
    v(&mut (*m).wmutex)?;
    Ok(())
}

/// Wakes every futex waiter on `addr` whose bitset intersects `mask`,
/// matching `shm.cpp`'s "wake everyone eligible" intent (that port always
/// passes `INT_MAX` as the wake count).
unsafe fn futex_wake_bitset(addr: *mut u32, mask: u32) {
    libc::syscall(
        libc::SYS_futex,
        addr,
        libc::FUTEX_WAKE_BITSET,
        i32::MAX,
        std::ptr::null::<libc::timespec>(),
        std::ptr::null::<u32>(),
        mask,
    );
}

enum FutexWaitResult {
    Woken,
    SpuriousOrChanged,
    TimedOut,
}

/// Blocks until `addr`'s value differs from `expected` (as signaled by a
/// matching wake) or `deadline` passes. `deadline` is an absolute instant;
/// `None` waits forever.
fn futex_wait_bitset(addr: *mut u32, expected: u32, mask: u32, deadline: Option<Instant>) -> FutexWaitResult {
    let timeout_spec = deadline.map(|d| {
        let remaining = d.saturating_duration_since(Instant::now());
        monotonic_deadline(remaining)
    });

    let ts_ptr = timeout_spec
        .as_ref()
        .map(|ts| ts as *const libc::timespec)
        .unwrap_or(std::ptr::null());

    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr,
            libc::FUTEX_WAIT_BITSET,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            mask,
        )
    };

    if rc == 0 {
        return FutexWaitResult::Woken;
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ETIMEDOUT) => FutexWaitResult::TimedOut,
        _ => FutexWaitResult::SpuriousOrChanged,
    }
}

/// Builds an absolute `CLOCK_MONOTONIC` timespec `remaining` in the future,
/// as required by `FUTEX_WAIT_BITSET` (absolute unless `FUTEX_CLOCK_REALTIME`
/// is set, which this implementation does not use).
fn monotonic_deadline(remaining: Duration) -> libc::timespec {
    let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now);
    }
    let mut secs = now.tv_sec + remaining.as_secs() as i64;
    let mut nsecs = now.tv_nsec + remaining.subsec_nanos() as i64;
    if nsecs >= 1_000_000_000 {
        secs += 1;
        nsecs -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: secs,
        tv_nsec: nsecs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcm::Vcm;

    fn test_vcm(name: &str) -> Vcm {
        let cfg = format!(
            "protocol = udp\nname = {name}\nA 4 int little unsigned\nB 8 float big\n8081 {{\n  A\n  B\n}}\nvirtual {{\n  A\n}}\n"
        );
        Vcm::parse(&cfg, std::path::PathBuf::from(".")).unwrap()
    }

    fn anchor(name: &str) -> PathBuf {
        PathBuf::from(format!("/tmp/gsw-tshm-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn write_then_standard_read_sees_bytes() {
        let vcm = test_vcm("write-read");
        let anchor = anchor("write-read");
        let tshm = Tshm::create(&vcm, &anchor).unwrap();

        let bytes = [1u8, 2, 3, 4, 5, 6, 7, 8];
        tshm.write(0, &bytes, 0).unwrap();

        match tshm.read_lock(&[0], ReadMode::Standard, None) {
            Outcome::Success(updated) => {
                assert!(updated[0]);
                let buf = unsafe { tshm.get_buffer(0) };
                assert_eq!(buf, &bytes);
            }
            _ => panic!("expected success"),
        }
        tshm.read_unlock(false).unwrap();
    }

    #[test]
    fn nonblocking_miss_returns_blocked() {
        let vcm = test_vcm("nb-miss");
        let anchor = anchor("nb-miss");
        let tshm = Tshm::create(&vcm, &anchor).unwrap();

        // prime the cache with a standard read first.
        tshm.write(0, &[0u8; 12], 0).unwrap();
        let _ = tshm.read_lock(&[0], ReadMode::Standard, None);
        tshm.read_unlock(false).unwrap();

        match tshm.read_lock(&[0], ReadMode::NonBlocking, None) {
            Outcome::Blocked => {}
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[test]
    fn write_rejects_wrong_length() {
        let vcm = test_vcm("bad-len");
        let anchor = anchor("bad-len");
        let tshm = Tshm::create(&vcm, &anchor).unwrap();
        assert!(tshm.write(0, &[0u8; 1], 0).is_err());
    }

    #[test]
    fn more_recent_packet_handles_wraparound() {
        let vcm = test_vcm("recency");
        let anchor = anchor("recency");
        let tshm = Tshm::create(&vcm, &anchor).unwrap();
        assert!(tshm.more_recent_packet(0x0000_0001, 0x0000_0001, 0xFFFF_FFFE));
    }
}
