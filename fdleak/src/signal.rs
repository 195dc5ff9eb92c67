//! Dump trigger
//!
//! The signal handler does nothing but claim the dump slot and start a
//! detached worker thread with `pthread_create`. Everything else (region
//! lookup, symbolization, logging, export) happens on that worker. If the
//! worker cannot be created, a fixed message and the failure count are
//! written straight to stderr and the slot is released again, so a later
//! trigger gets a fresh attempt.

#![allow(unsafe_code)]

use libc::{c_int, c_void, siginfo_t};
use std::mem::MaybeUninit;
use std::panic::AssertUnwindSafe;
use std::ptr;

use crate::detector::{global, Detector};
use crate::domain::DetectorError;
use crate::intercept::{errno, set_errno};

const SPAWN_FAILED: &[u8] = b"fd_leak_debug: cannot create dump worker thread, failures = ";

/// Install the dump trigger for `signal`
///
/// # Errors
/// Returns [`DetectorError::SignalHandler`] if `sigaction` fails
pub fn install_dump_handler(signal: c_int) -> Result<(), DetectorError> {
    // SAFETY: an all-zero sigaction is a valid starting value.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction =
        on_dump_signal as extern "C" fn(c_int, *mut siginfo_t, *mut c_void) as libc::sighandler_t;
    action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO | libc::SA_ONSTACK;

    // SAFETY: `action` is fully initialized and outlives both calls.
    let rc = unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signal, &action, ptr::null_mut())
    };
    if rc != 0 {
        return Err(DetectorError::SignalHandler { signal, source: std::io::Error::last_os_error() });
    }
    Ok(())
}

extern "C" fn on_dump_signal(_signal: c_int, _info: *mut siginfo_t, _context: *mut c_void) {
    let Some(detector) = global() else {
        return;
    };
    let saved_errno = errno();
    trigger(detector);
    set_errno(saved_errno);
}

/// Start a dump worker unless one is already running
///
/// Async-signal-safe: atomics, `pthread_create` and `write` only.
pub fn trigger(detector: &'static Detector) {
    let dumps = detector.dump_controller();
    if !dumps.try_begin() {
        return;
    }
    if spawn_worker().is_err() {
        let failures = dumps.record_spawn_failure();
        report_spawn_failure(failures);
        dumps.finish();
    }
}

fn spawn_worker() -> Result<(), c_int> {
    spawn_with_state(libc::PTHREAD_CREATE_DETACHED)
}

fn spawn_with_state(detach_state: c_int) -> Result<(), c_int> {
    let mut thread = MaybeUninit::<libc::pthread_t>::uninit();
    let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();

    // SAFETY: attr is initialized by pthread_attr_init before any other use
    // and destroyed exactly once.
    unsafe {
        let rc = libc::pthread_attr_init(attr.as_mut_ptr());
        if rc != 0 {
            return Err(rc);
        }
        // A worker that cannot be detached is never reclaimed; don't start it.
        let mut rc = libc::pthread_attr_setdetachstate(attr.as_mut_ptr(), detach_state);
        if rc == 0 {
            rc = libc::pthread_create(thread.as_mut_ptr(), attr.as_ptr(), dump_worker, ptr::null_mut());
        }
        libc::pthread_attr_destroy(attr.as_mut_ptr());
        if rc == 0 {
            Ok(())
        } else {
            Err(rc)
        }
    }
}

extern "C" fn dump_worker(_arg: *mut c_void) -> *mut c_void {
    if let Some(detector) = global() {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = detector.run_triggered();
        }));
        if outcome.is_err() {
            detector.dump_controller().finish();
        }
    }
    ptr::null_mut()
}

fn report_spawn_failure(failures: usize) {
    let mut digits = [0u8; 20];
    let count = format_decimal(failures, &mut digits);
    for chunk in [SPAWN_FAILED, count, b"\n".as_slice()] {
        // SAFETY: writing a valid buffer to stderr.
        unsafe { libc::write(libc::STDERR_FILENO, chunk.as_ptr().cast(), chunk.len()) };
    }
}

/// Render `value` in decimal without allocating
fn format_decimal(mut value: usize, buf: &mut [u8; 20]) -> &[u8] {
    let mut start = buf.len();
    loop {
        start -= 1;
        // Always < 10.
        #[allow(clippy::cast_possible_truncation)]
        let digit = (value % 10) as u8;
        buf[start] = b'0' + digit;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &buf[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_decimal() {
        let mut buf = [0u8; 20];
        assert_eq!(format_decimal(0, &mut buf), b"0");
        assert_eq!(format_decimal(1234, &mut buf), b"1234");
        assert_eq!(format_decimal(usize::MAX, &mut buf), usize::MAX.to_string().as_bytes());
    }

    #[test]
    fn test_worker_not_started_without_detach_state() {
        assert_eq!(spawn_with_state(-1), Err(libc::EINVAL));
        assert_eq!(spawn_worker(), Ok(()));
    }

    #[test]
    fn test_install_rejects_uncatchable_signal() {
        let err = install_dump_handler(libc::SIGKILL).unwrap_err();
        assert!(matches!(err, DetectorError::SignalHandler { signal, .. } if signal == libc::SIGKILL));
    }
}
