//! Shared Segment (§4.2): a thin wrapper around a named, fixed-size shared
//! memory region identified by a `(path, small_int_tag)` pair.
//!
//! Generalizes the teacher's `ipc::shared_memory::SharedMemoryConnection`
//! (which owns one ring buffer identified by an `os_id` string) to an
//! arbitrary fixed-size tagged region: the `os_id` here is simply
//! `"{path}_{tag}"`, letting many logical segments (master block, per-packet
//! data, per-packet nonce, per-packet write-lock) share one stable
//! filesystem anchor by varying the tag.

use std::path::Path;

use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, warn};

use crate::error::GswError;

/// A named, fixed-size shared memory region.
///
/// Holds the raw `Shmem` handle; callers obtain typed views onto its backing
/// bytes via [`SharedSegment::as_ptr`]. Detaches on drop (`Shmem`'s own
/// `Drop` impl), matching §4.2's `detach` operation; `destroy` is explicit
/// since, unlike `detach`, it is only ever performed once by `shmctl`.
pub struct SharedSegment {
    os_id: String,
    shmem: Shmem,
    size: usize,
}

// SAFETY: the backing memory is a POSIX shared mapping intended to be
// accessed concurrently from many processes under the synchronization
// protocol implemented on top (TShm's semaphores); the handle itself holds
// no process-local aliasing that would make cross-thread access unsound.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    fn os_id(path: &Path, tag: i32) -> String {
        format!("{}_{}", path.display(), tag)
    }

    /// Create a new segment of `size` bytes. Fails if it already exists.
    pub fn create(path: &Path, tag: i32, size: usize) -> Result<Self, GswError> {
        let os_id = Self::os_id(path, tag);
        let mut shmem = ShmemConf::new()
            .size(size)
            .os_id(&os_id)
            .create()
            .map_err(|e| map_shmem_err("create", &os_id, e))?;
        // `create()` returns an *owning* handle that `shm_unlink`s the
        // backing object the instant it drops — which, for `shmctl -on`,
        // is the moment `main` returns. Per §3's lifecycle ("created once
        // by a shmctl tool... destroyed once on shutdown"), the segment
        // must outlive that process. Relinquish ownership here; `destroy`
        // reacquires it explicitly so `-off` is the one that unlinks.
        shmem.set_owner(false);
        debug!(os_id, size, "created shared segment");
        Ok(Self { os_id, shmem, size })
    }

    /// Attach to an existing segment.
    pub fn attach(path: &Path, tag: i32, size: usize) -> Result<Self, GswError> {
        let os_id = Self::os_id(path, tag);
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(&os_id)
            .open()
            .map_err(|e| map_shmem_err("attach", &os_id, e))?;
        Ok(Self { os_id, shmem, size })
    }

    /// Attach if it exists, otherwise create it. Used by components other
    /// than `shmctl` that don't care which process happened to run first
    /// (`shmctl` itself always uses `create` so a stale, already-existing
    /// segment is a loud error rather than silently reused).
    pub fn create_or_attach(path: &Path, tag: i32, size: usize) -> Result<Self, GswError> {
        match Self::attach(path, tag, size) {
            Ok(s) => Ok(s),
            Err(_) => Self::create(path, tag, size),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    /// Destroy the segment (removes the OS-level backing object). Only
    /// `shmctl -off` should call this — other processes merely detach by
    /// dropping their `SharedSegment`.
    pub fn destroy(mut self) {
        // `create` relinquished ownership so the segment would survive
        // past `shmctl -on`'s own exit; reacquire it here so this handle's
        // `Drop` actually `shm_unlink`s the backing object. Whether this
        // handle came from `create` or `attach`, it is now the one that
        // unlinks.
        self.shmem.set_owner(true);
        let os_id = self.os_id.clone();
        drop(self);
        debug!(os_id, "destroyed shared segment");
    }
}

fn map_shmem_err(op: &str, os_id: &str, e: ShmemError) -> GswError {
    warn!(os_id, op, error = %e, "shared segment operation failed");
    GswError::failure("SharedSegment", "shm_op", format!("{op} '{os_id}' failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unique_path(name: &str) -> PathBuf {
        PathBuf::from(format!("/tmp/gsw-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn create_then_attach_share_memory() {
        let path = unique_path("shm-create-attach");
        let seg = SharedSegment::create(&path, 0, 16).unwrap();
        unsafe {
            *seg.as_ptr() = 0x42;
        }
        let seg2 = SharedSegment::attach(&path, 0, 16).unwrap();
        unsafe {
            assert_eq!(*seg2.as_ptr(), 0x42);
        }
    }

    #[test]
    fn create_twice_fails() {
        let path = unique_path("shm-create-twice");
        let _seg = SharedSegment::create(&path, 1, 16).unwrap();
        assert!(SharedSegment::create(&path, 1, 16).is_err());
    }
}
