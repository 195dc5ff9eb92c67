//! Domain types providing compile-time safety and self-documentation
//!
//! A [`ResourceKey`] is what the leak table indexes by. Keeping it distinct
//! from a raw `i32` descriptor stops mapping addresses and descriptors from
//! being mixed up at call sites.

use serde::Serialize;
use std::fmt;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Pid(pub i32);

impl Pid {
    /// ID of the calling process
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn current() -> Self {
        Pid(std::process::id() as i32)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Identifier of a tracked resource
///
/// Either a file descriptor number or the base address of a mapping.
/// Only unique among live records: descriptor numbers and addresses are
/// reused by the kernel once released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct ResourceKey(pub u64);

impl ResourceKey {
    /// Key for a (non-negative) file descriptor
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn from_fd(fd: i32) -> Self {
        ResourceKey(u64::from(fd as u32))
    }

    /// Key for a mapping base address
    #[must_use]
    pub fn from_addr(addr: *const libc::c_void) -> Self {
        ResourceKey(addr as usize as u64)
    }

    /// Interpret the key as a file descriptor
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn as_fd(self) -> i32 {
        self.0 as u32 as i32
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_key_roundtrip() {
        let key = ResourceKey::from_fd(42);
        assert_eq!(key, ResourceKey(42));
        assert_eq!(key.as_fd(), 42);
    }

    #[test]
    fn test_addr_key() {
        let key = ResourceKey::from_addr(0x7f00_dead_b000 as *const libc::c_void);
        assert_eq!(key.0, 0x7f00_dead_b000);
    }

    #[test]
    fn test_pid_display() {
        assert_eq!(Pid(1234).to_string(), "PID:1234");
    }
}
