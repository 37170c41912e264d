//! Process-wide job queues for signal handlers.
//!
//! A signal handler has no access to runtime state, so the runtime installs
//! its [`JobQueues`] here once. Handlers then trigger postponed jobs with
//! [`trigger_installed`], which only performs atomic operations.
//!
//! On Unix, [`bind_signal`] installs a handler that triggers a given job
//! whenever a signal arrives.

use crate::{JobHandle, JobQueues};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

static INSTALLED: OnceLock<Arc<JobQueues>> = OnceLock::new();

/// Errors from installing signal-side state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    /// A process-wide instance is already installed.
    #[error("job queues already installed")]
    AlreadyInstalled,
    /// No process-wide instance is installed.
    #[error("job queues not installed")]
    NotInstalled,
    /// The signal number is out of range.
    #[error("invalid signal number {0}")]
    InvalidSignal(i32),
    /// The handle does not name a slot.
    #[error("invalid postponed job handle")]
    InvalidHandle,
    /// The OS refused to install the handler.
    #[error("signal handler install failed: {0}")]
    InstallFailed(String),
}

/// Make `queues` the process-wide instance.
pub fn install(queues: Arc<JobQueues>) -> Result<(), SignalError> {
    INSTALLED
        .set(queues)
        .map_err(|_| SignalError::AlreadyInstalled)
}

/// The process-wide instance, if installed.
#[inline]
pub fn installed() -> Option<&'static Arc<JobQueues>> {
    INSTALLED.get()
}

/// Trigger `handle` on the process-wide instance. Returns `false` if no
/// instance is installed or the handle is invalid. Async-signal-safe.
#[inline]
pub fn trigger_installed(handle: JobHandle) -> bool {
    match INSTALLED.get() {
        Some(queues) if handle.is_valid() => {
            queues.trigger(handle);
            true
        }
        _ => false,
    }
}

#[cfg(unix)]
mod unix {
    use super::{trigger_installed, SignalError, INSTALLED};
    use crate::JobHandle;
    use std::sync::atomic::{AtomicU32, Ordering};

    const MAX_SIGNAL: usize = 65;

    #[allow(clippy::declare_interior_mutable_const)]
    const UNBOUND: AtomicU32 = AtomicU32::new(u32::MAX);

    /// Job handle bound to each signal number.
    static BINDINGS: [AtomicU32; MAX_SIGNAL] = [UNBOUND; MAX_SIGNAL];

    extern "C" fn on_signal(signum: libc::c_int) {
        let Some(slot) = usize::try_from(signum).ok().and_then(|s| BINDINGS.get(s)) else {
            return;
        };
        let handle = JobHandle::from_raw(slot.load(Ordering::Acquire));
        trigger_installed(handle);
    }

    /// Install a handler for `signum` that triggers `handle` on the
    /// process-wide instance each time the signal is delivered.
    pub fn bind_signal(signum: libc::c_int, handle: JobHandle) -> Result<(), SignalError> {
        if INSTALLED.get().is_none() {
            return Err(SignalError::NotInstalled);
        }
        if !handle.is_valid() {
            return Err(SignalError::InvalidHandle);
        }
        let slot = usize::try_from(signum)
            .ok()
            .filter(|&s| s > 0)
            .and_then(|s| BINDINGS.get(s))
            .ok_or(SignalError::InvalidSignal(signum))?;
        slot.store(handle.to_raw(), Ordering::Release);

        // SAFETY: `action` is fully initialised before use and `on_signal`
        // only performs atomic loads and stores.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                slot.store(u32::MAX, Ordering::Release);
                return Err(SignalError::InstallFailed(
                    std::io::Error::last_os_error().to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
pub use unix::bind_signal;
