//! # fdleak - Runtime Descriptor and Mapping Leak Detector
//!
//! fdleak is loaded into a target process (normally through `LD_PRELOAD`)
//! and watches every file descriptor, socket and memory mapping the process
//! acquires and releases. For each resource still held it remembers the call
//! path that acquired it, and on demand writes a report of everything that
//! was acquired but never released.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Instrumented Program                        │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ open / close / socket / mmap / ...
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Exported shims (fdleak-preload cdylib)             │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      fdleak (This Crate)                        │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │ Interceptor  │──▶│  Leak Table  │◀──│   Detector   │◀─ signal│
//! │  │  (RealOps)   │   │ (slots+stats)│   │ (dump worker)│         │
//! │  └──────────────┘   └──────┬───────┘   └──────┬───────┘         │
//! │                            │                  │                 │
//! │                     ┌──────┴───────┐   ┌──────▼───────┐         │
//! │                     │ Stack capture│   │    Report    │         │
//! │                     │ + self region│   │ (log + JSON) │         │
//! │                     └──────────────┘   └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`intercept`]: the [`RealOps`] seam, the `dlsym(RTLD_NEXT)` provider and
//!   the [`Interceptor`] that reports successful calls
//! - [`table`]: fixed-capacity leak table with statistics and snapshots
//! - [`stack`]: call-path capture (aarch64 frame-pointer walk, generic
//!   unwinder elsewhere) and report formatting
//! - [`self_region`]: the detector's own code range, used to ignore its own
//!   releases
//! - [`detector`]: the process-wide context, initialization and dump flow
//! - [`signal`]: the asynchronous dump trigger
//! - [`report`] / [`export`]: report rendering, logging and JSON files
//! - [`symbolization`]: `/proc/self/maps` parsing and DWARF lookup
//! - [`config`]: environment configuration
//! - [`process_lookup`]: program names and PID lookup via `/proc`
//! - [`domain`]: shared value types and error enums
//!
//! ## Triggering a Dump
//!
//! ```text
//! kill -28 <pid>        first time: start tracking
//! kill -28 <pid>        later: log every live record under `fd_leak_debug`
//! ```
//!
//! ## Failure Model
//!
//! Nothing here ever aborts or fails the host program. A full table drops new
//! records, an unreadable `/proc` degrades reports, and a worker that cannot
//! be started is counted and skipped.

pub mod config;
pub mod detector;
pub mod domain;
pub mod export;
pub mod intercept;
pub mod process_lookup;
pub mod report;
pub mod self_region;
pub mod signal;
pub mod stack;
pub mod symbolization;
pub mod table;

pub use config::Config;
pub use detector::{Detector, DetectorBuilder, DumpController};
pub use domain::{ConfigError, DetectorError, ExportError, Pid, ResourceKey};
pub use intercept::{InternalScope, Interceptor, LibcOps, RealOps};
pub use report::{LeakEntry, LeakReport, ResourceIdentity};
pub use self_region::SelfRegion;
pub use stack::CallPath;
pub use table::{AddOutcome, LeakRecord, LeakStats, LeakTable, RemoveOutcome, TableSnapshot};
