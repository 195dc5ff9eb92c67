//! Memory mapping utilities for process address space analysis
//!
//! This module parses `/proc/<pid>/maps` into [`MapEntry`] values. The
//! detector uses it twice: once to find the mapping that holds its own code
//! (self-suppression), and at dump time to attribute each captured return
//! address to the object it belongs to.

use anyhow::{Context, Result};
use log::debug;
use serde::Serialize;
use std::fs;

/// Half-open `[start, end)` address range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One line of a maps file:
/// `start-end perms offset dev inode pathname`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub range: MemoryRange,
    pub perms: String,
    /// File offset of `range.start`
    pub offset: u64,
    /// Backing file, or a pseudo name such as `[stack]`; `None` for anonymous memory
    pub path: Option<String>,
}

impl MapEntry {
    /// Parse a single maps line, returning `None` on malformed input
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        // Fields are single-space separated; the pathname is padded.
        let mut fields = line.splitn(6, ' ');
        let range = fields.next()?;
        let perms = fields.next()?;
        let offset = fields.next()?;
        let _dev = fields.next()?;
        let _inode = fields.next()?;
        let path = fields.next().map(str::trim).filter(|p| !p.is_empty()).map(str::to_string);

        let (start, end) = range.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let offset = u64::from_str_radix(offset, 16).ok()?;

        Some(MapEntry { range: MemoryRange { start, end }, perms: perms.to_string(), offset, path })
    }

    /// Whether the mapping holds executable code
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.perms.as_bytes().get(2) == Some(&b'x')
    }

    /// Whether the mapping is backed by a file on disk
    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        self.path.as_deref().is_some_and(|p| p.starts_with('/'))
    }
}

/// Parse the contents of a maps file, skipping malformed lines
#[must_use]
pub fn parse_maps(content: &str) -> Vec<MapEntry> {
    content.lines().filter_map(MapEntry::parse).collect()
}

/// Read and parse `/proc/<pid>/maps` (`/proc/self/maps` when `pid` is `None`)
///
/// # Errors
/// Returns an error if the maps file cannot be read
pub fn read_maps(pid: Option<i32>) -> Result<Vec<MapEntry>> {
    let maps_path = match pid {
        Some(pid) => format!("/proc/{pid}/maps"),
        None => "/proc/self/maps".to_string(),
    };
    let maps = fs::read_to_string(&maps_path).context(format!("Failed to read {maps_path}"))?;
    let entries = parse_maps(&maps);
    debug!("Parsed {} mappings from {maps_path}", entries.len());
    Ok(entries)
}

/// Find the mapping containing `addr`
#[must_use]
pub fn find_entry(entries: &[MapEntry], addr: u64) -> Option<&MapEntry> {
    entries.iter().find(|e| e.range.contains(addr))
}

/// Overall load range of a mapped object
///
/// Covers every mapping of `path`, from the minimum start address to the
/// maximum end address. The start is the object's load base, which is what
/// DWARF addresses of position-independent objects are relative to.
#[must_use]
pub fn load_range(entries: &[MapEntry], path: &str) -> Option<MemoryRange> {
    let mut start_addr = None;
    let mut end_addr = None;

    for entry in entries.iter().filter(|e| e.path.as_deref() == Some(path)) {
        start_addr = Some(start_addr.map_or(entry.range.start, |s: u64| s.min(entry.range.start)));
        end_addr = Some(end_addr.map_or(entry.range.end, |e: u64| e.max(entry.range.end)));
    }

    match (start_addr, end_addr) {
        (Some(start), Some(end)) => Some(MemoryRange { start, end }),
        _ => None,
    }
}
