// String formatting intentionally uses format! for clarity
#![allow(clippy::format_push_string)]

use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectKind, ObjectSection};
use rustc_demangle::demangle;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// DWARF symbolizer for one mapped object (executable or shared library)
///
/// Includes a cache to avoid re-resolving the same addresses repeatedly:
/// leak records with the same origin share most of their frames.
pub struct Symbolizer {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
    /// Position-independent objects are looked up relative to their load base
    relocatable: bool,
    /// Cache of resolved frames by object-relative address
    cache: RefCell<HashMap<u64, ResolvedFrame>>,
}

impl Symbolizer {
    /// Create a new symbolizer for the given object file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if DWARF debug info is missing
    pub fn new<P: AsRef<Path>>(object_path: P) -> Result<Self> {
        let data = fs::read(object_path.as_ref()).context("Failed to read object file")?;

        let obj_file = object::File::parse(&*data).context("Failed to parse object file")?;
        let relocatable = obj_file.kind() != ObjectKind::Executable;

        let endian =
            if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj_file
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section)?;
        let ctx = Context::from_dwarf(dwarf).context("Failed to load DWARF debug information")?;

        Ok(Self { ctx, relocatable, cache: RefCell::new(HashMap::new()) })
    }

    /// Whether lookups must subtract the object's load base
    #[must_use]
    pub fn is_relocatable(&self) -> bool {
        self.relocatable
    }

    /// Resolve an object-relative address to its (possibly inlined) frames
    pub fn resolve(&self, addr: u64) -> ResolvedFrame {
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }

        let mut frames = Vec::new();
        if let Ok(mut frame_iter) = self.ctx.find_frames(addr).skip_all_loads() {
            while let Ok(Some(frame)) = frame_iter.next() {
                let Some(function) =
                    frame.function.and_then(|f| f.demangle().ok().map(|s| s.to_string()))
                else {
                    continue;
                };

                let location = frame.location.map(|loc| SourceLocation {
                    file: loc.file.map(std::string::ToString::to_string),
                    line: loc.line,
                });

                frames.push(InlinedFrame { function, location });
            }
        }

        let resolved = ResolvedFrame { addr, frames };
        self.cache.borrow_mut().insert(addr, resolved.clone());
        resolved
    }

    /// Demangle a Rust symbol name
    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        format!("{:#}", demangle(symbol))
    }
}

/// A resolved address; empty `frames` means DWARF had no answer
#[derive(Debug, Clone)]
pub struct ResolvedFrame {
    pub addr: u64,
    /// Innermost (inlined) frame first
    pub frames: Vec<InlinedFrame>,
}

/// An inlined frame within a resolved frame
#[derive(Debug, Clone)]
pub struct InlinedFrame {
    pub function: String,
    pub location: Option<SourceLocation>,
}

/// Source code location
#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl ResolvedFrame {
    /// Outermost function containing the address
    #[must_use]
    pub fn function(&self) -> Option<&str> {
        self.frames.last().map(|f| f.function.as_str())
    }

    /// `" at file:line"` suffixes for every frame that has a location,
    /// innermost first
    #[must_use]
    pub fn locations(&self) -> Vec<String> {
        let mut output = Vec::new();
        for inlined in &self.frames {
            let Some(ref loc) = inlined.location else { continue };
            let Some(ref file) = loc.file else { continue };

            let mut line = format!("{} at {file}", inlined.function);
            if let Some(number) = loc.line {
                line.push_str(&format!(":{number}"));
            }
            output.push(line);
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demangle_symbol() {
        let name = Symbolizer::demangle_symbol("_ZN6fdleak5table9LeakTable3add17h0123456789abcdefE");
        assert_eq!(name, "fdleak::table::LeakTable::add");
    }

    #[test]
    fn test_missing_object_is_an_error() {
        assert!(Symbolizer::new("/nonexistent/object.so").is_err());
    }

    #[test]
    fn test_resolved_frame_helpers() {
        let frame = ResolvedFrame {
            addr: 0x1234,
            frames: vec![
                InlinedFrame {
                    function: "inner".to_string(),
                    location: Some(SourceLocation {
                        file: Some("src/lib.rs".to_string()),
                        line: Some(42),
                    }),
                },
                InlinedFrame { function: "outer".to_string(), location: None },
            ],
        };

        assert_eq!(frame.function(), Some("outer"));
        assert_eq!(frame.locations(), vec!["inner at src/lib.rs:42".to_string()]);
    }
}
