//! # fdleak-preload - Interposition Library
//!
//! Built as a `cdylib` and loaded ahead of libc with `LD_PRELOAD`. It exports
//! the intercepted libc symbols and, from a load-time constructor, installs
//! the process-wide detector and its dump trigger.
//!
//! ```text
//! LD_PRELOAD=libfdleak_preload.so FDLEAK_KIND=file ./server
//! kill -28 $(pidof server)      # start tracking
//! kill -28 $(pidof server)      # dump leaks to stderr
//! ```
//!
//! Every export only builds an [`Interceptor`] over the libc provider and
//! the installed detector; all logic lives in the `fdleak` crate.

// Exported symbols must be unmangled, and each carries the contract of its
// libc counterpart.
#![allow(unsafe_code, clippy::missing_safety_doc)]

use env_logger::Env;
use fdleak::detector::{global, install};
use fdleak::process_lookup::current_program_name;
use fdleak::signal::install_dump_handler;
use fdleak::{Config, Detector, Interceptor, LibcOps};
use fdleak_common::ENV_LOG;
use libc::{c_char, c_int, c_void, mode_t, off_t, size_t, sockaddr, socklen_t};
use log::{debug, error, info, warn};

static REAL: LibcOps = LibcOps::new();

#[used]
#[link_section = ".init_array"]
static INIT: extern "C" fn() = fdleak_init;

extern "C" fn fdleak_init() {
    let _ = env_logger::Builder::from_env(Env::new().filter_or(ENV_LOG, "info")).try_init();

    let program = current_program_name();
    let config = Config::from_env();
    if !config.applies_to(&program) {
        debug!("Leak detector disabled for {program}");
        return;
    }

    let detector = match install(Detector::from_config(&config, &program)) {
        Ok(detector) => detector,
        Err(e) => {
            error!("Leak detector not installed for {program}: {e}");
            return;
        }
    };

    let pid = std::process::id();
    match install_dump_handler(config.signal) {
        Ok(()) => info!("Set leak detector signal handler for {program}({pid}) successfully"),
        Err(e) => error!("Unable to set up leak detector signal handler for {program}({pid}): {e}"),
    }

    if config.autostart {
        if let Err(e) = detector.initialize() {
            warn!("Leak detector autostart failed: {e}");
        }
    }
}

fn interceptor() -> Interceptor<'static, LibcOps> {
    Interceptor::new(&REAL, global())
}

// `open`, `open64` and `openat` are variadic in C. The mode is read from the
// slot a third (fourth) argument would occupy and only passed on when the
// flags say a file may be created.

#[no_mangle]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    interceptor().open(path, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    interceptor().open64(path, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    interceptor().openat(dirfd, path, flags, mode)
}

#[no_mangle]
pub extern "C" fn dup(oldfd: c_int) -> c_int {
    interceptor().dup(oldfd)
}

#[no_mangle]
pub extern "C" fn dup2(oldfd: c_int, newfd: c_int) -> c_int {
    interceptor().dup2(oldfd, newfd)
}

#[no_mangle]
pub extern "C" fn dup3(oldfd: c_int, newfd: c_int, flags: c_int) -> c_int {
    interceptor().dup3(oldfd, newfd, flags)
}

#[no_mangle]
pub extern "C" fn close(fd: c_int) -> c_int {
    // Keeps this frame on the stack; a tail call would shift the frames
    // self-suppression skips.
    std::hint::black_box(interceptor().close(fd))
}

#[no_mangle]
pub extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    interceptor().socket(domain, ty, protocol)
}

#[no_mangle]
pub unsafe extern "C" fn accept(sockfd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    interceptor().accept(sockfd, addr, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn accept4(
    sockfd: c_int,
    addr: *mut sockaddr,
    addrlen: *mut socklen_t,
    flags: c_int,
) -> c_int {
    interceptor().accept4(sockfd, addr, addrlen, flags)
}

#[no_mangle]
pub unsafe extern "C" fn socketpair(domain: c_int, ty: c_int, protocol: c_int, sv: *mut c_int) -> c_int {
    interceptor().socketpair(domain, ty, protocol, sv)
}

#[no_mangle]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    len: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    interceptor().mmap(addr, len, prot, flags, fd, offset)
}

#[no_mangle]
pub unsafe extern "C" fn munmap(addr: *mut c_void, len: size_t) -> c_int {
    std::hint::black_box(interceptor().munmap(addr, len))
}
