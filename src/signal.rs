//! Uniform cancellation semantics (§5): SIGINT/SIGTERM/SIGSEGV/SIGFPE/
//! SIGABRT are all treated the same — set an atomic `killed` flag and evict
//! any blocked TShm wait via the escape hatch, then let the normal control
//! flow fall out of the blocking call and exit cleanly. Grounded on
//! `original_source`'s `sighandler()` methods and the teacher's signal-
//! unaware `main.rs` (this system needs signal handling the teacher does
//! not, so the mechanism itself is new, built in the teacher's plain,
//! `nix`-based style).

use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::info;

use crate::tshm::sighandler_raw;

/// Set once a termination signal has been observed; checked by every
/// component's event loop after a blocking call returns.
pub static KILLED: AtomicBool = AtomicBool::new(false);

/// The current process's master-nonce pointer, so the raw signal handler
/// (which cannot capture state) can find it.
static MASTER_NONCE_PTR: AtomicPtr<u32> = AtomicPtr::new(std::ptr::null_mut());

pub fn is_killed() -> bool {
    KILLED.load(Ordering::SeqCst)
}

/// Installs the uniform handler for SIGINT/SIGTERM/SIGSEGV/SIGFPE/SIGABRT
/// and records `master_nonce_ptr` for the escape hatch.
///
/// # Safety
/// `master_nonce_ptr` must remain valid (the owning `Tshm` must outlive the
/// process) for as long as the handler is installed, i.e. for the rest of
/// the process's life.
pub unsafe fn install(master_nonce_ptr: *mut u32) {
    MASTER_NONCE_PTR.store(master_nonce_ptr, Ordering::SeqCst);

    let action = SigAction::new(SigHandler::Handler(handle_signal), SaFlags::empty(), SigSet::empty());
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGSEGV, Signal::SIGFPE, Signal::SIGABRT] {
        let _ = signal::sigaction(sig, &action);
    }
    info!("signal handling installed");
}

extern "C" fn handle_signal(_sig: libc::c_int) {
    KILLED.store(true, Ordering::SeqCst);
    let ptr = MASTER_NONCE_PTR.load(Ordering::SeqCst);
    if !ptr.is_null() {
        // SAFETY: only called from within the signal handler this module
        // installed, against a pointer set by `install` before any signal
        // could arrive; `mmap` is async-signal-safe.
        unsafe { sighandler_raw(ptr) };
    }
}
