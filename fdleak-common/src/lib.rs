//! # Shared Definitions (detector ↔ control tool)
//!
//! Constants and small enums shared between the preloaded detector
//! (`fdleak` / `fdleak-preload`) and the `fdleak-ctl` command-line tool.
//! Keeping them in one `no_std` crate guarantees that both sides agree on
//! environment variable names, the trigger signal and the leak kind encoding.
//!
//! ## Key Types
//!
//! - [`LeakKind`] - Category of a tracked resource (file, socket, mapping)
//! - [`KindFilter`] - Which kinds the detector records

#![no_std]

use core::fmt;

// ============================================================================
// Capacity Constants
// ============================================================================

/// Default number of slots in the leak table
///
/// The table never grows. Acquisitions of new keys beyond this many live
/// records are counted as discarded.
pub const MAX_LEAK_RECORDS: usize = 2048;

/// Maximum number of return addresses captured per call path
pub const DEFAULT_BACKTRACE_FRAMES: usize = 32;

/// Signal that triggers a dump (`SIGWINCH` on Linux)
///
/// Chosen because most programs ignore it and its default action is to
/// do nothing, so delivering it to an uninstrumented process is harmless.
pub const DUMP_SIGNAL: i32 = 28;

/// Log target used for every report line
pub const LOG_TARGET: &str = "fd_leak_debug";

// ============================================================================
// Environment Variables
// ============================================================================

/// Leak kind selector: `all`, `file`, `socket`, `mmap` or `0`-`3`
pub const ENV_KIND: &str = "FDLEAK_KIND";

/// Only instrument programs whose name contains this value
pub const ENV_PROGRAM: &str = "FDLEAK_PROGRAM";

/// Signal number overriding [`DUMP_SIGNAL`]
pub const ENV_SIGNAL: &str = "FDLEAK_SIGNAL";

/// When `1`, tracking starts at load time instead of on the first signal
pub const ENV_AUTOSTART: &str = "FDLEAK_AUTOSTART";

/// When `0`, report frames are not resolved through DWARF debug info
pub const ENV_SYMBOLIZE: &str = "FDLEAK_SYMBOLIZE";

/// Directory receiving a JSON copy of every dump
pub const ENV_EXPORT_DIR: &str = "FDLEAK_EXPORT_DIR";

/// Leak table capacity overriding [`MAX_LEAK_RECORDS`]
pub const ENV_CAPACITY: &str = "FDLEAK_CAPACITY";

/// `env_logger` filter for the preloaded library
pub const ENV_LOG: &str = "FDLEAK_LOG";

// ============================================================================
// Leak Kinds
// ============================================================================

/// Category of a tracked resource
///
/// The numeric values match the `FDLEAK_KIND` encoding, where `0` is
/// reserved: as a slot kind it marks an empty slot, as a filter it means
/// "all kinds".
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LeakKind {
    /// Empty slot sentinel
    #[default]
    None = 0,
    /// Descriptor returned by `open`/`dup` and friends
    File = 1,
    /// Descriptor returned by `socket`/`accept`/`socketpair`
    Socket = 2,
    /// Base address returned by `mmap`
    Mmap = 3,
}

impl LeakKind {
    /// Number of kinds including [`LeakKind::None`]; sizes per-kind counters
    pub const COUNT: usize = 4;

    /// Kinds that can be recorded, in report order
    pub const TRACKED: [LeakKind; 3] = [LeakKind::File, LeakKind::Socket, LeakKind::Mmap];

    /// Index into per-kind counter arrays
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Name used in reports
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            LeakKind::None => "none",
            LeakKind::File => "file",
            LeakKind::Socket => "socket",
            LeakKind::Mmap => "mmap",
        }
    }

    /// Decode the numeric encoding
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(LeakKind::None),
            1 => Some(LeakKind::File),
            2 => Some(LeakKind::Socket),
            3 => Some(LeakKind::Mmap),
            _ => None,
        }
    }
}

impl fmt::Display for LeakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which leak kinds the detector records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KindFilter {
    #[default]
    All,
    Only(LeakKind),
}

impl KindFilter {
    /// Whether an event of `kind` should be recorded
    #[must_use]
    pub fn matches(self, kind: LeakKind) -> bool {
        match self {
            KindFilter::All => kind != LeakKind::None,
            KindFilter::Only(only) => only == kind,
        }
    }

    /// Parse a `FDLEAK_KIND` value (a kind name or its number)
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Ok(raw) = value.parse::<u8>() {
            return match LeakKind::from_raw(raw)? {
                LeakKind::None => Some(KindFilter::All),
                kind => Some(KindFilter::Only(kind)),
            };
        }

        if value.eq_ignore_ascii_case("all") {
            Some(KindFilter::All)
        } else if value.eq_ignore_ascii_case("file") {
            Some(KindFilter::Only(LeakKind::File))
        } else if value.eq_ignore_ascii_case("socket") {
            Some(KindFilter::Only(LeakKind::Socket))
        } else if value.eq_ignore_ascii_case("mmap") || value.eq_ignore_ascii_case("mapping") {
            Some(KindFilter::Only(LeakKind::Mmap))
        } else {
            None
        }
    }
}

impl fmt::Display for KindFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KindFilter::All => f.write_str("all"),
            KindFilter::Only(kind) => f.write_str(kind.name()),
        }
    }
}
