//! JSON export of leak reports
//!
//! When an export directory is configured every dump is also written as
//! `fdleak-<pid>-<seq>.json`, where `seq` counts dumps within the process.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::domain::ExportError;
use crate::report::LeakReport;

/// Writes reports into one directory
pub struct ReportExporter {
    dir: PathBuf,
    sequence: AtomicUsize,
}

impl ReportExporter {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), sequence: AtomicUsize::new(0) }
    }

    /// Serialize `report` to any writer
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails
    pub fn export<W: Write>(report: &LeakReport, writer: W) -> Result<(), ExportError> {
        let mut writer = BufWriter::new(writer);
        serde_json::to_writer_pretty(&mut writer, report)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Write `report` to the next file in the export directory
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written
    pub fn write(&self, report: &LeakReport) -> Result<PathBuf, ExportError> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("fdleak-{}-{seq}.json", report.pid.0));
        let file = File::create(&path).map_err(|source| ExportError::WriteFailed {
            path: path.display().to_string(),
            source,
        })?;
        Self::export(report, file)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Pid;
    use crate::table::LeakStats;

    fn report() -> LeakReport {
        LeakReport { program: "app".to_string(), pid: Pid(77), stats: LeakStats::default(), entries: Vec::new() }
    }

    #[test]
    fn test_export_creates_valid_json() {
        let mut buffer = Vec::new();
        ReportExporter::export(&report(), &mut buffer).unwrap();

        let parsed: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(parsed["program"], "app");
        assert_eq!(parsed["stats"]["discarded"], 0);
        assert!(parsed["entries"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_write_numbers_files() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ReportExporter::new(dir.path());

        let first = exporter.write(&report()).unwrap();
        let second = exporter.write(&report()).unwrap();
        assert_eq!(first, dir.path().join("fdleak-77-0.json"));
        assert_eq!(second, dir.path().join("fdleak-77-1.json"));
        assert!(second.exists());
    }

    #[test]
    fn test_write_into_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = ReportExporter::new(dir.path().join("missing"));
        let err = exporter.write(&report()).unwrap_err();
        assert!(matches!(err, ExportError::WriteFailed { .. }));
    }
}
