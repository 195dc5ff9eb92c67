//! Location of the detector's own code
//!
//! Release calls whose call path passes through the detector are its own
//! bookkeeping (reading `/proc`, loading debug info, writing exports) and
//! must not touch the leak table. To recognize them the detector needs the
//! address range of its own executable mapping, found once through
//! `/proc/self/maps` and cached for the rest of the process lifetime.

use log::info;
use std::sync::OnceLock;

use crate::domain::{DetectorError, Pid};
use crate::symbolization::{find_entry, read_maps, MapEntry, MemoryRange};

/// Lazily resolved, never invalidated code range of the detector
#[derive(Debug, Default)]
pub struct SelfRegion {
    range: OnceLock<MemoryRange>,
}

impl SelfRegion {
    /// A region that has not been looked up yet; suppresses nothing
    #[must_use]
    pub const fn unresolved() -> Self {
        Self { range: OnceLock::new() }
    }

    /// A region with a known range
    #[must_use]
    pub fn fixed(range: MemoryRange) -> Self {
        let region = Self::unresolved();
        let _ = region.range.set(range);
        region
    }

    /// The cached range, if resolved
    #[must_use]
    pub fn get(&self) -> Option<MemoryRange> {
        self.range.get().copied()
    }

    /// Resolve from `/proc/self/maps`; later calls return the cached range
    ///
    /// # Errors
    /// Returns an error if the maps file cannot be read or has no mapping
    /// containing the detector's code
    pub fn resolve(&self) -> Result<MemoryRange, DetectorError> {
        if let Some(range) = self.get() {
            return Ok(range);
        }
        let entries = read_maps(None).map_err(|_| DetectorError::MemoryMapsParseFailed(Pid::current()))?;
        self.resolve_from(&entries, anchor_address())
    }

    /// Resolve using the executable mapping of `entries` that contains `anchor`
    ///
    /// # Errors
    /// Returns an error if no executable mapping contains `anchor`
    pub fn resolve_from(&self, entries: &[MapEntry], anchor: u64) -> Result<MemoryRange, DetectorError> {
        if let Some(range) = self.get() {
            return Ok(range);
        }

        let entry = find_entry(entries, anchor)
            .filter(|entry| entry.is_executable())
            .ok_or(DetectorError::NoRegionForAddress { pid: Pid::current(), addr: anchor })?;
        // A racing resolver stores the same value; keep whichever landed first.
        let range = *self.range.get_or_init(|| entry.range);
        info!(
            "Detector code region: 0x{:x} - 0x{:x} ({})",
            range.start,
            range.end,
            entry.path.as_deref().unwrap_or("<anonymous>")
        );
        Ok(range)
    }

    /// Whether any of `frames` lies inside the region
    ///
    /// Always `false` while unresolved.
    #[must_use]
    pub fn contains_any(&self, frames: &[usize]) -> bool {
        self.get().is_some_and(|range| frames.iter().any(|&ip| range.contains(ip as u64)))
    }

    /// `frames` without the leading run that lies inside the region
    #[must_use]
    pub fn strip_leading<'a>(&self, frames: &'a [usize]) -> &'a [usize] {
        let Some(range) = self.get() else {
            return frames;
        };
        let own = frames.iter().take_while(|&&ip| range.contains(ip as u64)).count();
        &frames[own..]
    }
}

/// An address inside the detector's own code
#[must_use]
#[inline(never)]
pub fn anchor_address() -> u64 {
    (anchor_address as fn() -> u64) as usize as u64
}
