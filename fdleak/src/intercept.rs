//! # Interception Layer
//!
//! Every intercepted call goes through an [`Interceptor`]: it forwards to a
//! [`RealOps`] provider, returns the real result unchanged, and on success
//! reports the acquisition or release to the installed [`Detector`].
//!
//! ```text
//! exported shim (fdleak-preload)
//!        │
//!        ▼
//! Interceptor::close ──▶ LeakTable::remove     (release: before the real call)
//!        │
//!        ▼
//! RealOps::close ──▶ dlsym(RTLD_NEXT, "close")
//! ```
//!
//! Releases are reported *before* closing a descriptor: once the real
//! `close` returns, another thread may already have been handed the same
//! number by a fresh `open`. Mappings are released only after a successful
//! `munmap`.
//!
//! The exported symbols themselves live in the `cdylib`; this module only
//! holds the logic so the test suite can drive it with a fake provider.

#![allow(unsafe_code)]

use fdleak_common::LeakKind;
use libc::{c_char, c_int, c_uint, c_void, mode_t, off_t, size_t, sockaddr, socklen_t};
use std::cell::Cell;
use std::ffi::CStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::detector::Detector;
use crate::domain::ResourceKey;

/// The real resource operations the shims forward to
///
/// Methods mirror their libc counterparts, including the `-1`/`MAP_FAILED`
/// error convention with `errno`.
pub trait RealOps: Sync {
    /// # Safety
    /// `path` must be a valid NUL-terminated string.
    unsafe fn open(&self, path: *const c_char, flags: c_int, mode: mode_t) -> c_int;

    /// # Safety
    /// `path` must be a valid NUL-terminated string.
    unsafe fn open64(&self, path: *const c_char, flags: c_int, mode: mode_t) -> c_int;

    /// # Safety
    /// `path` must be a valid NUL-terminated string.
    unsafe fn openat(&self, dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int;

    fn dup(&self, oldfd: c_int) -> c_int;
    fn dup2(&self, oldfd: c_int, newfd: c_int) -> c_int;
    fn dup3(&self, oldfd: c_int, newfd: c_int, flags: c_int) -> c_int;
    fn close(&self, fd: c_int) -> c_int;
    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> c_int;

    /// # Safety
    /// `addr` and `addrlen` must be null or valid for writes.
    unsafe fn accept(&self, sockfd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int;

    /// # Safety
    /// `addr` and `addrlen` must be null or valid for writes.
    unsafe fn accept4(
        &self,
        sockfd: c_int,
        addr: *mut sockaddr,
        addrlen: *mut socklen_t,
        flags: c_int,
    ) -> c_int;

    /// # Safety
    /// `sv` must be valid for writing two descriptors.
    unsafe fn socketpair(&self, domain: c_int, ty: c_int, protocol: c_int, sv: *mut c_int) -> c_int;

    /// # Safety
    /// Same contract as `mmap(2)`.
    unsafe fn mmap(
        &self,
        addr: *mut c_void,
        len: size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: off_t,
    ) -> *mut c_void;

    /// # Safety
    /// Same contract as `munmap(2)`.
    unsafe fn munmap(&self, addr: *mut c_void, len: size_t) -> c_int;
}

// ============================================================================
// dlsym(RTLD_NEXT) provider
// ============================================================================

/// A libc symbol looked up lazily through `dlsym(RTLD_NEXT, ...)`
///
/// The lookup is idempotent, so racing first calls just store the same
/// address twice.
struct RealSymbol {
    name: &'static CStr,
    addr: AtomicUsize,
}

impl RealSymbol {
    const fn new(name: &'static CStr) -> Self {
        Self { name, addr: AtomicUsize::new(0) }
    }

    fn address(&self) -> Option<usize> {
        let cached = self.addr.load(Ordering::Relaxed);
        if cached != 0 {
            return Some(cached);
        }
        // SAFETY: `name` is NUL-terminated; RTLD_NEXT is a valid handle.
        let found = unsafe { libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr()) } as usize;
        if found == 0 {
            return None;
        }
        self.addr.store(found, Ordering::Relaxed);
        Some(found)
    }

    /// The symbol as a function pointer of type `F`
    ///
    /// # Safety
    /// `F` must be the symbol's real function pointer type.
    unsafe fn get<F: Copy>(&self) -> Option<F> {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
        self.address().map(|addr| std::mem::transmute_copy::<usize, F>(&addr))
    }
}

type OpenFn = unsafe extern "C" fn(*const c_char, c_int, ...) -> c_int;
type OpenatFn = unsafe extern "C" fn(c_int, *const c_char, c_int, ...) -> c_int;
type Fd1Fn = unsafe extern "C" fn(c_int) -> c_int;
type Fd2Fn = unsafe extern "C" fn(c_int, c_int) -> c_int;
type Fd3Fn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type AcceptFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
type Accept4Fn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t, c_int) -> c_int;
type SocketpairFn = unsafe extern "C" fn(c_int, c_int, c_int, *mut c_int) -> c_int;
type MmapFn = unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off_t) -> *mut c_void;
type MunmapFn = unsafe extern "C" fn(*mut c_void, size_t) -> c_int;

/// [`RealOps`] backed by the next definition of each symbol after the
/// calling object, normally libc's
pub struct LibcOps {
    open: RealSymbol,
    open64: RealSymbol,
    openat: RealSymbol,
    dup: RealSymbol,
    dup2: RealSymbol,
    dup3: RealSymbol,
    close: RealSymbol,
    socket: RealSymbol,
    accept: RealSymbol,
    accept4: RealSymbol,
    socketpair: RealSymbol,
    mmap: RealSymbol,
    munmap: RealSymbol,
}

impl LibcOps {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            open: RealSymbol::new(c"open"),
            open64: RealSymbol::new(c"open64"),
            openat: RealSymbol::new(c"openat"),
            dup: RealSymbol::new(c"dup"),
            dup2: RealSymbol::new(c"dup2"),
            dup3: RealSymbol::new(c"dup3"),
            close: RealSymbol::new(c"close"),
            socket: RealSymbol::new(c"socket"),
            accept: RealSymbol::new(c"accept"),
            accept4: RealSymbol::new(c"accept4"),
            socketpair: RealSymbol::new(c"socketpair"),
            mmap: RealSymbol::new(c"mmap"),
            munmap: RealSymbol::new(c"munmap"),
        }
    }
}

impl Default for LibcOps {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "android")]
use libc::__errno as errno_location;
#[cfg(not(target_os = "android"))]
use libc::__errno_location as errno_location;

pub(crate) fn errno() -> c_int {
    // SAFETY: the errno location is valid for the calling thread.
    unsafe { *errno_location() }
}

pub(crate) fn set_errno(code: c_int) {
    // SAFETY: the errno location is valid for the calling thread.
    unsafe { *errno_location() = code };
}

/// Fail the way libc does when a symbol is missing entirely
fn enosys<T>(failure: T) -> T {
    set_errno(libc::ENOSYS);
    failure
}

impl RealOps for LibcOps {
    unsafe fn open(&self, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        match self.open.get::<OpenFn>() {
            Some(real) => real(path, flags, c_uint::from(mode)),
            None => enosys(-1),
        }
    }

    unsafe fn open64(&self, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        match self.open64.get::<OpenFn>() {
            Some(real) => real(path, flags, c_uint::from(mode)),
            None => enosys(-1),
        }
    }

    unsafe fn openat(&self, dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        match self.openat.get::<OpenatFn>() {
            Some(real) => real(dirfd, path, flags, c_uint::from(mode)),
            None => enosys(-1),
        }
    }

    fn dup(&self, oldfd: c_int) -> c_int {
        // SAFETY: dup has no memory-safety preconditions.
        unsafe {
            match self.dup.get::<Fd1Fn>() {
                Some(real) => real(oldfd),
                None => enosys(-1),
            }
        }
    }

    fn dup2(&self, oldfd: c_int, newfd: c_int) -> c_int {
        // SAFETY: dup2 has no memory-safety preconditions.
        unsafe {
            match self.dup2.get::<Fd2Fn>() {
                Some(real) => real(oldfd, newfd),
                None => enosys(-1),
            }
        }
    }

    fn dup3(&self, oldfd: c_int, newfd: c_int, flags: c_int) -> c_int {
        // SAFETY: dup3 has no memory-safety preconditions.
        unsafe {
            match self.dup3.get::<Fd3Fn>() {
                Some(real) => real(oldfd, newfd, flags),
                None => enosys(-1),
            }
        }
    }

    fn close(&self, fd: c_int) -> c_int {
        // SAFETY: ownership of `fd` is the caller's concern, as with close(2).
        unsafe {
            match self.close.get::<Fd1Fn>() {
                Some(real) => real(fd),
                None => enosys(-1),
            }
        }
    }

    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> c_int {
        // SAFETY: socket has no memory-safety preconditions.
        unsafe {
            match self.socket.get::<Fd3Fn>() {
                Some(real) => real(domain, ty, protocol),
                None => enosys(-1),
            }
        }
    }

    unsafe fn accept(&self, sockfd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
        match self.accept.get::<AcceptFn>() {
            Some(real) => real(sockfd, addr, addrlen),
            None => enosys(-1),
        }
    }

    unsafe fn accept4(
        &self,
        sockfd: c_int,
        addr: *mut sockaddr,
        addrlen: *mut socklen_t,
        flags: c_int,
    ) -> c_int {
        match self.accept4.get::<Accept4Fn>() {
            Some(real) => real(sockfd, addr, addrlen, flags),
            None => enosys(-1),
        }
    }

    unsafe fn socketpair(&self, domain: c_int, ty: c_int, protocol: c_int, sv: *mut c_int) -> c_int {
        match self.socketpair.get::<SocketpairFn>() {
            Some(real) => real(domain, ty, protocol, sv),
            None => enosys(-1),
        }
    }

    unsafe fn mmap(
        &self,
        addr: *mut c_void,
        len: size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: off_t,
    ) -> *mut c_void {
        match self.mmap.get::<MmapFn>() {
            Some(real) => real(addr, len, prot, flags, fd, offset),
            None => enosys(libc::MAP_FAILED),
        }
    }

    unsafe fn munmap(&self, addr: *mut c_void, len: size_t) -> c_int {
        match self.munmap.get::<MunmapFn>() {
            Some(real) => real(addr, len),
            None => enosys(-1),
        }
    }
}

// ============================================================================
// Internal-thread guard
// ============================================================================

thread_local! {
    static INTERNAL: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as doing the detector's own work
///
/// While a scope is alive, intercepted calls on this thread are forwarded
/// but neither recorded nor released.
pub struct InternalScope {
    previous: bool,
}

impl InternalScope {
    #[must_use]
    pub fn enter() -> Self {
        let previous = INTERNAL.try_with(|flag| flag.replace(true)).unwrap_or(false);
        Self { previous }
    }

    #[must_use]
    pub fn is_active() -> bool {
        INTERNAL.try_with(Cell::get).unwrap_or(false)
    }
}

impl Drop for InternalScope {
    fn drop(&mut self) {
        let _ = INTERNAL.try_with(|flag| flag.set(self.previous));
    }
}

// ============================================================================
// Interceptor
// ============================================================================

/// Forwards one intercepted call and reports its outcome
///
/// `detector` is `None` until one is installed; calls are then forwarded
/// untouched.
pub struct Interceptor<'a, O: RealOps> {
    ops: &'a O,
    detector: Option<&'a Detector>,
}

impl<'a, O: RealOps> Interceptor<'a, O> {
    #[must_use]
    pub fn new(ops: &'a O, detector: Option<&'a Detector>) -> Self {
        Self { ops, detector }
    }

    fn acquired(&self, fd: c_int, kind: LeakKind) {
        if fd >= 0 {
            self.record(ResourceKey::from_fd(fd), kind);
        }
    }

    fn record(&self, key: ResourceKey, kind: LeakKind) {
        let Some(detector) = self.detector else {
            return;
        };
        if detector.tracks(kind) && !InternalScope::is_active() {
            detector.table().add(key, kind);
        }
    }

    /// Must stay inlined: self-suppression counts the frames between
    /// `LeakTable::remove` and the exported shim.
    #[inline(always)]
    fn released(&self, key: ResourceKey) {
        let Some(detector) = self.detector else {
            return;
        };
        if detector.is_initialized() && !InternalScope::is_active() {
            detector.table().remove(key);
        }
    }

    /// # Safety
    /// `path` must be a valid NUL-terminated string.
    #[inline(never)]
    pub unsafe fn open(&self, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        let fd = self.ops.open(path, flags, creation_mode(flags, mode));
        self.acquired(fd, LeakKind::File);
        fd
    }

    /// # Safety
    /// `path` must be a valid NUL-terminated string.
    #[inline(never)]
    pub unsafe fn open64(&self, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        let fd = self.ops.open64(path, flags, creation_mode(flags, mode));
        self.acquired(fd, LeakKind::File);
        fd
    }

    /// # Safety
    /// `path` must be a valid NUL-terminated string.
    #[inline(never)]
    pub unsafe fn openat(&self, dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        let fd = self.ops.openat(dirfd, path, flags, creation_mode(flags, mode));
        self.acquired(fd, LeakKind::File);
        fd
    }

    #[inline(never)]
    pub fn dup(&self, oldfd: c_int) -> c_int {
        let fd = self.ops.dup(oldfd);
        self.acquired(fd, LeakKind::File);
        fd
    }

    #[inline(never)]
    pub fn dup2(&self, oldfd: c_int, newfd: c_int) -> c_int {
        let fd = self.ops.dup2(oldfd, newfd);
        self.acquired(fd, LeakKind::File);
        fd
    }

    #[inline(never)]
    pub fn dup3(&self, oldfd: c_int, newfd: c_int, flags: c_int) -> c_int {
        let fd = self.ops.dup3(oldfd, newfd, flags);
        self.acquired(fd, LeakKind::File);
        fd
    }

    #[inline(never)]
    pub fn close(&self, fd: c_int) -> c_int {
        if fd >= 0 {
            self.released(ResourceKey::from_fd(fd));
        }
        self.ops.close(fd)
    }

    #[inline(never)]
    pub fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> c_int {
        let fd = self.ops.socket(domain, ty, protocol);
        self.acquired(fd, LeakKind::Socket);
        fd
    }

    /// # Safety
    /// `addr` and `addrlen` must be null or valid for writes.
    #[inline(never)]
    pub unsafe fn accept(&self, sockfd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
        let fd = self.ops.accept(sockfd, addr, addrlen);
        self.acquired(fd, LeakKind::Socket);
        fd
    }

    /// # Safety
    /// `addr` and `addrlen` must be null or valid for writes.
    #[inline(never)]
    pub unsafe fn accept4(
        &self,
        sockfd: c_int,
        addr: *mut sockaddr,
        addrlen: *mut socklen_t,
        flags: c_int,
    ) -> c_int {
        let fd = self.ops.accept4(sockfd, addr, addrlen, flags);
        self.acquired(fd, LeakKind::Socket);
        fd
    }

    /// Both ends are recorded as separate sockets
    ///
    /// # Safety
    /// `sv` must be valid for writing two descriptors.
    #[inline(never)]
    pub unsafe fn socketpair(&self, domain: c_int, ty: c_int, protocol: c_int, sv: *mut c_int) -> c_int {
        let ret = self.ops.socketpair(domain, ty, protocol, sv);
        if ret == 0 {
            self.acquired(*sv, LeakKind::Socket);
            self.acquired(*sv.add(1), LeakKind::Socket);
        }
        ret
    }

    /// # Safety
    /// Same contract as `mmap(2)`.
    #[inline(never)]
    pub unsafe fn mmap(
        &self,
        addr: *mut c_void,
        len: size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: off_t,
    ) -> *mut c_void {
        let mapped = self.ops.mmap(addr, len, prot, flags, fd, offset);
        if mapped != libc::MAP_FAILED {
            self.record(ResourceKey::from_addr(mapped), LeakKind::Mmap);
        }
        mapped
    }

    /// # Safety
    /// Same contract as `munmap(2)`.
    #[inline(never)]
    pub unsafe fn munmap(&self, addr: *mut c_void, len: size_t) -> c_int {
        let ret = self.ops.munmap(addr, len);
        if ret == 0 {
            self.released(ResourceKey::from_addr(addr));
        }
        ret
    }
}

/// The mode argument is only meaningful when a file may be created
fn creation_mode(flags: c_int, mode: mode_t) -> mode_t {
    if flags & libc::O_CREAT != 0 || flags & libc::O_TMPFILE == libc::O_TMPFILE {
        mode
    } else {
        0
    }
}
