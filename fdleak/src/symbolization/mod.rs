//! # Address Attribution
//!
//! Turns raw return addresses captured at acquisition time into something a
//! human can act on. Two pieces of information are needed for every frame:
//!
//! 1. **Which object it belongs to** - found by looking the address up in
//!    `/proc/self/maps` ([`memory_maps`]).
//! 2. **Which function it is in** - found through the object's DWARF debug
//!    information ([`symbolizer`]), falling back to the dynamic symbol table.
//!
//! ## Address Translation
//!
//! Shared libraries and PIE executables are loaded at a randomized base, but
//! their DWARF data uses addresses relative to that base:
//!
//! ```text
//! Object Address = Runtime Address - Load Base
//! ```
//!
//! The load base is the lowest start address of any mapping of the object
//! (see [`memory_maps::load_range`]). Non-PIE executables are looked up with
//! the runtime address unchanged.
//!
//! The same maps parser also serves the self-region resolver, which needs the
//! executable mapping that contains the detector's own code.

pub mod memory_maps;
pub mod symbolizer;

pub use memory_maps::{find_entry, load_range, parse_maps, read_maps, MapEntry, MemoryRange};
pub use symbolizer::Symbolizer;
