//! Call-path formatting for leak reports
//!
//! Every captured address becomes one line in the familiar
//! `#NN pc <offset>  <object> (<function>)` layout, followed by one line per
//! inlined frame that has a source location.

#![allow(unsafe_code)] // dladdr()

use log::{debug, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CStr;
use std::rc::Rc;

use crate::symbolization::symbolizer::ResolvedFrame;
use crate::symbolization::{find_entry, load_range, read_maps, MapEntry, Symbolizer};

/// Resolves and formats call paths against one snapshot of the address space
///
/// Built once per dump. Symbolizers are loaded lazily per object and kept
/// for the lifetime of the formatter, so objects shared by many call paths
/// are parsed only once.
pub struct StackFormatter {
    maps: Vec<MapEntry>,
    symbolize: bool,
    /// Per object path; `None` remembers objects without usable DWARF
    symbolizers: RefCell<HashMap<String, Option<Rc<Symbolizer>>>>,
}

impl StackFormatter {
    /// Create a formatter for the current process
    ///
    /// An unreadable `/proc/self/maps` is not fatal: frames are then printed
    /// as raw addresses.
    #[must_use]
    pub fn new(symbolize: bool) -> Self {
        let maps = read_maps(None).unwrap_or_else(|e| {
            warn!("Failed to read memory maps: {e}. Frames will not be attributed.");
            Vec::new()
        });
        Self::with_maps(maps, symbolize)
    }

    /// Create a formatter over an explicit set of mappings
    #[must_use]
    pub fn with_maps(maps: Vec<MapEntry>, symbolize: bool) -> Self {
        Self { maps, symbolize, symbolizers: RefCell::new(HashMap::new()) }
    }

    /// Format a whole call path, one or more lines per frame
    #[must_use]
    pub fn format(&self, frames: &[usize]) -> Vec<String> {
        let mut lines = Vec::with_capacity(frames.len());
        for (i, &addr) in frames.iter().enumerate() {
            self.format_frame(i, addr as u64, &mut lines);
        }
        lines
    }

    fn format_frame(&self, index: usize, addr: u64, lines: &mut Vec<String>) {
        let Some(entry) = find_entry(&self.maps, addr) else {
            lines.push(format!("#{index:02} pc {addr:016x}  <unknown>"));
            return;
        };

        let (rel_pc, object) = self.adjust_address(entry, addr);
        let mut line = format!("#{index:02} pc {rel_pc:016x}  {object}");
        let mut inlined = Vec::new();

        if self.symbolize {
            let resolved = self.resolve_dwarf(entry, addr, rel_pc);
            let function = resolved.as_ref().and_then(ResolvedFrame::function).map(str::to_string);
            if let Some(function) = function.or_else(|| dynamic_symbol(addr)) {
                line.push_str(&format!(" ({function})"));
            }
            if let Some(resolved) = resolved {
                inlined = resolved.locations();
            }
        }

        lines.push(line);
        lines.extend(inlined.into_iter().map(|loc| format!("        {loc}")));
    }

    /// Translate a runtime address into an object-relative one
    ///
    /// Returns (`relative_pc`, `object_name`). Anonymous mappings keep the
    /// absolute address.
    fn adjust_address(&self, entry: &MapEntry, addr: u64) -> (u64, String) {
        match entry.path.as_deref() {
            Some(path) if entry.is_file_backed() => {
                let base = load_range(&self.maps, path).map_or(entry.range.start, |r| r.start);
                (addr - base, path.to_string())
            }
            Some(name) => (addr, name.to_string()),
            None => (addr, "<anonymous>".to_string()),
        }
    }

    fn resolve_dwarf(
        &self,
        entry: &MapEntry,
        addr: u64,
        rel_pc: u64,
    ) -> Option<ResolvedFrame> {
        if !entry.is_file_backed() {
            return None;
        }
        let path = entry.path.as_deref()?;
        let symbolizer = self.symbolizer_for(path)?;
        let lookup = if symbolizer.is_relocatable() { rel_pc } else { addr };
        Some(symbolizer.resolve(lookup))
    }

    fn symbolizer_for(&self, path: &str) -> Option<Rc<Symbolizer>> {
        if let Some(cached) = self.symbolizers.borrow().get(path) {
            return cached.clone();
        }

        let loaded = match Symbolizer::new(path) {
            Ok(symbolizer) => Some(Rc::new(symbolizer)),
            Err(e) => {
                debug!("No DWARF for {path}: {e}");
                None
            }
        };
        self.symbolizers.borrow_mut().insert(path.to_string(), loaded.clone());
        loaded
    }
}

/// Nearest exported symbol for an address, as `name+offset`
fn dynamic_symbol(addr: u64) -> Option<String> {
    // SAFETY: an all-zero Dl_info is a valid out-parameter.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    // SAFETY: dladdr only inspects the loader's bookkeeping for `addr`.
    if unsafe { libc::dladdr(addr as usize as *const libc::c_void, &mut info) } == 0
        || info.dli_sname.is_null()
    {
        return None;
    }

    // SAFETY: dli_sname is a NUL-terminated string owned by the loader.
    let raw = unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy();
    let name = Symbolizer::demangle_symbol(&raw);
    let offset = addr.saturating_sub(info.dli_saddr as usize as u64);
    Some(format!("{name}+{offset}"))
}
