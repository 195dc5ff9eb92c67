//! # Detector
//!
//! The process-wide context: leak table, kind filter, initialization state
//! and the dump controller. Exactly one detector is installed per process
//! (see [`install`]); tests build as many private instances as they like.
//!
//! ## Initialization
//!
//! A freshly installed detector records nothing. The first dump trigger (or
//! autostart) resolves the detector's own code region and flips
//! [`Detector::is_initialized`]; from then on acquisitions are recorded and
//! later triggers produce reports.

use fdleak_common::{KindFilter, LeakKind};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::config::Config;
use crate::domain::DetectorError;
use crate::export::ReportExporter;
use crate::intercept::InternalScope;
use crate::process_lookup::current_program_name;
use crate::report::LeakReport;
use crate::self_region::SelfRegion;
use crate::stack::StackFormatter;
use crate::table::LeakTable;

static GLOBAL: OnceLock<Detector> = OnceLock::new();

/// Install the process-wide detector
///
/// # Errors
/// Returns [`DetectorError::AlreadyInstalled`] if one is already installed
pub fn install(detector: Detector) -> Result<&'static Detector, DetectorError> {
    GLOBAL.set(detector).map_err(|_| DetectorError::AlreadyInstalled)?;
    GLOBAL.get().ok_or(DetectorError::AlreadyInstalled)
}

/// The installed detector, if any
#[must_use]
pub fn global() -> Option<&'static Detector> {
    GLOBAL.get()
}

/// Gate that keeps at most one dump in flight
///
/// Only atomics: [`DumpController::try_begin`] is called from signal context.
#[derive(Debug, Default)]
pub struct DumpController {
    active: AtomicBool,
    spawn_failures: AtomicUsize,
}

impl DumpController {
    #[must_use]
    pub const fn new() -> Self {
        Self { active: AtomicBool::new(false), spawn_failures: AtomicUsize::new(0) }
    }

    /// Claim the dump slot; `false` if a dump is already in flight
    pub fn try_begin(&self) -> bool {
        !self.active.swap(true, Ordering::AcqRel)
    }

    /// Release the dump slot
    pub fn finish(&self) {
        self.active.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Count a worker that could not be started; returns the new total
    pub fn record_spawn_failure(&self) -> usize {
        self.spawn_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn spawn_failures(&self) -> usize {
        self.spawn_failures.load(Ordering::Relaxed)
    }
}

/// Process-wide leak detector
pub struct Detector {
    table: LeakTable,
    filter: KindFilter,
    initialized: AtomicBool,
    dumps: DumpController,
    program: String,
    symbolize: bool,
    exporter: Option<ReportExporter>,
}

impl Detector {
    #[must_use]
    pub fn builder() -> DetectorBuilder {
        DetectorBuilder::default()
    }

    /// Build a detector for `program` from loaded configuration
    #[must_use]
    pub fn from_config(config: &Config, program: &str) -> Self {
        let mut builder = Self::builder()
            .program(program)
            .capacity(config.capacity)
            .filter(config.kind)
            .symbolize(config.symbolize);
        if let Some(dir) = &config.export_dir {
            builder = builder.export_dir(dir.clone());
        }
        builder.build()
    }

    #[must_use]
    pub fn table(&self) -> &LeakTable {
        &self.table
    }

    #[must_use]
    pub fn filter(&self) -> KindFilter {
        self.filter
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn dump_controller(&self) -> &DumpController {
        &self.dumps
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Whether an acquisition of `kind` should be recorded right now
    #[must_use]
    pub fn tracks(&self, kind: LeakKind) -> bool {
        self.is_initialized() && self.filter.matches(kind)
    }

    /// Resolve the detector's code region and start tracking
    ///
    /// # Errors
    /// Returns an error if the code region cannot be resolved; tracking
    /// stays off.
    pub fn initialize(&self) -> Result<(), DetectorError> {
        let _internal = InternalScope::enter();
        self.table.self_region().resolve()?;
        self.initialized.store(true, Ordering::Release);
        info!("Leak detector tracking {} for {}({})", self.filter, self.program, std::process::id());
        Ok(())
    }

    /// Work of one dump trigger, run on the dump worker
    ///
    /// Initializes on the first trigger, dumps on later ones, and releases
    /// the dump slot either way.
    pub fn run_triggered(&self) -> Option<LeakReport> {
        let report = if self.is_initialized() {
            Some(self.dump())
        } else {
            if let Err(e) = self.initialize() {
                warn!("Leak detector initialization failed: {e}");
            }
            None
        };
        self.dumps.finish();
        report
    }

    /// Snapshot, log and export every live record
    pub fn dump(&self) -> LeakReport {
        let _internal = InternalScope::enter();
        let snapshot = self.table.dump();
        let formatter = StackFormatter::new(self.symbolize);
        let report = LeakReport::build(&self.program, &snapshot, &formatter);
        report.emit();

        if let Some(exporter) = &self.exporter {
            match exporter.write(&report) {
                Ok(path) => info!("Leak report exported to {}", path.display()),
                Err(e) => warn!("Leak report export failed: {e}"),
            }
        }
        report
    }
}

/// Builder for [`Detector`]
pub struct DetectorBuilder {
    capacity: usize,
    filter: KindFilter,
    self_region: SelfRegion,
    start_initialized: bool,
    program: Option<String>,
    symbolize: bool,
    export_dir: Option<PathBuf>,
}

impl Default for DetectorBuilder {
    fn default() -> Self {
        let config = Config::default();
        Self {
            capacity: config.capacity,
            filter: config.kind,
            self_region: SelfRegion::unresolved(),
            start_initialized: false,
            program: None,
            symbolize: config.symbolize,
            export_dir: None,
        }
    }
}

impl DetectorBuilder {
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: KindFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Use a pre-resolved (or deliberately unresolved) code region
    #[must_use]
    pub fn self_region(mut self, region: SelfRegion) -> Self {
        self.self_region = region;
        self
    }

    /// Track from the start without resolving the code region
    #[must_use]
    pub fn start_initialized(mut self, yes: bool) -> Self {
        self.start_initialized = yes;
        self
    }

    #[must_use]
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    #[must_use]
    pub fn symbolize(mut self, yes: bool) -> Self {
        self.symbolize = yes;
        self
    }

    #[must_use]
    pub fn export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn build(self) -> Detector {
        Detector {
            table: LeakTable::new(self.capacity, self.self_region),
            filter: self.filter,
            initialized: AtomicBool::new(self.start_initialized),
            dumps: DumpController::new(),
            program: self.program.unwrap_or_else(current_program_name),
            symbolize: self.symbolize,
            exporter: self.export_dir.map(ReportExporter::new),
        }
    }
}
