//! Leak report assembly and output
//!
//! A [`LeakReport`] is built from a [`TableSnapshot`] after the table lock
//! has been released: descriptor paths are resolved through
//! `/proc/self/fd`, call paths are formatted, and the result is written to
//! the log under [`LOG_TARGET`] and optionally exported as JSON.

use fdleak_common::{LeakKind, LOG_TARGET};
use log::info;
use serde::{Serialize, Serializer};
use std::path::Path;

use crate::domain::Pid;
use crate::stack::StackFormatter;
use crate::table::{LeakStats, TableSnapshot};

/// Shown when a descriptor's link target cannot be read
pub const UNKNOWN_PATH: &str = "[Unknown]";

const OPEN_RULE: &str = "==============================================================";
const CLOSE_RULE: &str = "============================================================";

/// How a leaked resource is identified in the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceIdentity {
    File { fd: i32, path: String },
    Socket { fd: i32 },
    Mapping { addr: u64 },
}

impl ResourceIdentity {
    fn describe(&self) -> String {
        match self {
            ResourceIdentity::File { fd, path } => format!("fd = {fd}, path = {path}"),
            ResourceIdentity::Socket { fd } => format!("fd = {fd}"),
            ResourceIdentity::Mapping { addr } => format!("addr = 0x{addr:x}"),
        }
    }
}

/// One live record, resolved for output
#[derive(Debug, Clone, Serialize)]
pub struct LeakEntry {
    #[serde(serialize_with = "serialize_kind")]
    pub kind: LeakKind,
    pub count: usize,
    pub identity: ResourceIdentity,
    pub frames: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

/// Complete dump of one process
#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    pub program: String,
    pub pid: Pid,
    pub stats: LeakStats,
    pub entries: Vec<LeakEntry>,
}

impl LeakReport {
    /// Build a report for the current process
    #[must_use]
    pub fn build(program: &str, snapshot: &TableSnapshot, formatter: &StackFormatter) -> Self {
        Self::build_with(program, Pid::current(), snapshot, formatter, resolve_fd_path)
    }

    /// Build a report with an explicit descriptor-path resolver
    pub fn build_with(
        program: &str,
        pid: Pid,
        snapshot: &TableSnapshot,
        formatter: &StackFormatter,
        resolve_path: impl Fn(i32) -> String,
    ) -> Self {
        let entries = snapshot
            .records
            .iter()
            .map(|snap| {
                let record = &snap.record;
                let identity = match record.kind {
                    LeakKind::Mmap => ResourceIdentity::Mapping { addr: record.key.0 },
                    LeakKind::Socket => ResourceIdentity::Socket { fd: record.key.as_fd() },
                    _ => {
                        let fd = record.key.as_fd();
                        ResourceIdentity::File { fd, path: resolve_path(fd) }
                    }
                };
                LeakEntry {
                    kind: record.kind,
                    count: record.occurrences,
                    identity,
                    frames: formatter.format(record.call_path.frames()),
                    annotation: snap.annotation.clone(),
                }
            })
            .collect();

        Self { program: program.to_string(), pid, stats: snapshot.stats, entries }
    }

    /// Render the report as log lines
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        let pid = self.pid.0;
        let mut lines = vec![
            String::new(),
            OPEN_RULE.to_string(),
            format!("+++ {}({pid}) dumping leak information started. +++", self.program),
            String::new(),
        ];

        if self.stats.discarded > 0 {
            lines.push(format!("{{ Added: {}, Discarded: {} }}", self.stats.added, self.stats.discarded));
        }
        lines.push("{ [  file socket   mmap] }".to_string());
        lines.push(format!(
            "{{ [{:6} {:6} {:6}] }}",
            self.stats.added_of(LeakKind::File),
            self.stats.added_of(LeakKind::Socket),
            self.stats.added_of(LeakKind::Mmap)
        ));
        lines.push(String::new());

        for entry in &self.entries {
            lines.push(format!(
                "Leak Type: {}, count = {}, {}",
                entry.kind,
                entry.count,
                entry.identity.describe()
            ));
            lines.extend(entry.frames.iter().cloned());
            if let Some(annotation) = &entry.annotation {
                lines.extend(annotation.lines().map(str::to_string));
            }
            lines.push(String::new());
        }

        lines.push(format!("+++ {}({pid}) dumping leak information ended. +++", self.program));
        lines.push(CLOSE_RULE.to_string());
        lines.push(String::new());
        lines
    }

    /// Write the report to the log
    pub fn emit(&self) {
        for line in self.lines() {
            info!(target: LOG_TARGET, "{line}");
        }
    }
}

/// Link target of `/proc/self/fd/<fd>`, or [`UNKNOWN_PATH`]
#[must_use]
pub fn resolve_fd_path(fd: i32) -> String {
    std::fs::read_link(Path::new("/proc/self/fd").join(fd.to_string()))
        .map_or_else(|_| UNKNOWN_PATH.to_string(), |target| target.to_string_lossy().into_owned())
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_kind<S: Serializer>(kind: &LeakKind, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(kind.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_region::SelfRegion;
    use crate::stack::CallPath;
    use crate::table::{LeakRecord, LeakTable, SnapshotRecord};
    use crate::ResourceKey;
    use std::os::fd::AsRawFd;

    fn formatter() -> StackFormatter {
        StackFormatter::with_maps(Vec::new(), false)
    }

    fn record(kind: LeakKind, key: u64, occurrences: usize) -> SnapshotRecord {
        SnapshotRecord {
            record: LeakRecord {
                kind,
                key: ResourceKey(key),
                occurrences,
                call_path: CallPath::from_frames(&[0x10, 0x20]),
            },
            annotation: None,
        }
    }

    fn report(snapshot: &TableSnapshot) -> LeakReport {
        LeakReport::build_with("app", Pid(42), snapshot, &formatter(), |fd| format!("/tmp/f{fd}"))
    }

    #[test]
    fn test_entry_lines_per_kind() {
        let snapshot = TableSnapshot {
            stats: LeakStats::default(),
            records: vec![
                record(LeakKind::File, 5, 2),
                record(LeakKind::Socket, 9, 1),
                record(LeakKind::Mmap, 0x7f00_1000, 1),
            ],
        };
        let lines = report(&snapshot).lines();

        assert!(lines.contains(&"Leak Type: file, count = 2, fd = 5, path = /tmp/f5".to_string()));
        assert!(lines.contains(&"Leak Type: socket, count = 1, fd = 9".to_string()));
        assert!(lines.contains(&"Leak Type: mmap, count = 1, addr = 0x7f001000".to_string()));
        assert!(lines.contains(&"#00 pc 0000000000000010  <unknown>".to_string()));
    }

    #[test]
    fn test_banner_and_totals() {
        let table = LeakTable::new(1, SelfRegion::unresolved());
        table.add(ResourceKey(3), LeakKind::Socket);
        table.add(ResourceKey(4), LeakKind::Socket);
        let lines = report(&table.dump()).lines();

        assert_eq!(lines[1], OPEN_RULE);
        assert_eq!(lines[2], "+++ app(42) dumping leak information started. +++");
        assert!(lines.contains(&"{ Added: 1, Discarded: 1 }".to_string()));
        assert!(lines.contains(&"{ [     0      1      0] }".to_string()));
        assert_eq!(lines[lines.len() - 3], "+++ app(42) dumping leak information ended. +++");
    }

    #[test]
    fn test_no_discard_line_when_nothing_dropped() {
        let lines = report(&TableSnapshot::default()).lines();
        assert!(!lines.iter().any(|l| l.starts_with("{ Added")));
        assert!(lines.contains(&"{ [  file socket   mmap] }".to_string()));
    }

    #[test]
    fn test_annotation_follows_frames() {
        let mut snap = record(LeakKind::File, 5, 1);
        snap.annotation = Some("java frame a\njava frame b".to_string());
        let snapshot = TableSnapshot { stats: LeakStats::default(), records: vec![snap] };
        let lines = report(&snapshot).lines();

        let at = lines.iter().position(|l| l == "java frame a").unwrap();
        assert_eq!(lines[at + 1], "java frame b");
        assert!(lines[at - 1].starts_with("#01 pc"));
    }

    #[test]
    fn test_resolve_fd_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let resolved = resolve_fd_path(file.as_file().as_raw_fd());
        assert_eq!(Path::new(&resolved), file.path().canonicalize().unwrap());
        assert_eq!(resolve_fd_path(-1), UNKNOWN_PATH);
    }

    #[test]
    fn test_report_serializes() {
        let snapshot = TableSnapshot {
            stats: LeakStats::default(),
            records: vec![record(LeakKind::Mmap, 0x1000, 1)],
        };
        let json = serde_json::to_value(report(&snapshot)).unwrap();
        assert_eq!(json["pid"], 42);
        assert_eq!(json["entries"][0]["kind"], "mmap");
        assert_eq!(json["entries"][0]["identity"]["type"], "mapping");
        assert_eq!(json["entries"][0]["identity"]["addr"], 0x1000);
        assert!(json["entries"][0].get("annotation").is_none());
    }
}
