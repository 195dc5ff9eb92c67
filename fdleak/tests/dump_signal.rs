//! The signal-driven initialize-then-dump flow against the installed detector
//!
//! Lives in its own test binary: the global detector can be installed only
//! once per process.

#![allow(unsafe_code)]

use fdleak::detector::{global, install};
use fdleak::signal::install_dump_handler;
use fdleak::{Detector, DetectorError, ResourceKey};
use fdleak_common::LeakKind;
use std::path::Path;
use std::time::{Duration, Instant};

const TRIGGER: i32 = libc::SIGUSR2;

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn raise() {
    assert_eq!(unsafe { libc::raise(TRIGGER) }, 0);
}

fn exported(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn first_signal_initializes_second_dumps() {
    let dir = tempfile::tempdir().unwrap();
    let detector = install(
        Detector::builder()
            .program("dump-signal")
            .symbolize(false)
            .export_dir(dir.path())
            .build(),
    )
    .unwrap();
    assert!(matches!(
        install(Detector::builder().program("second").build()),
        Err(DetectorError::AlreadyInstalled)
    ));
    assert!(std::ptr::eq(global().unwrap(), detector));

    install_dump_handler(TRIGGER).unwrap();
    let dumps = detector.dump_controller();

    // First trigger: start tracking, no report.
    raise();
    wait_until("initialization", || detector.is_initialized());
    wait_until("worker exit", || !dumps.is_active());
    assert!(exported(dir.path()).is_empty());

    // A trigger while a dump is in flight is dropped.
    assert!(dumps.try_begin());
    raise();
    std::thread::sleep(Duration::from_millis(100));
    assert!(exported(dir.path()).is_empty());
    dumps.finish();

    // Second real trigger: report everything live.
    detector.table().add(ResourceKey(0x5a5a_0000), LeakKind::Mmap);
    raise();
    let pid = std::process::id();
    wait_until("export", || exported(dir.path()) == vec![format!("fdleak-{pid}-0.json")]);
    wait_until("worker exit", || !dumps.is_active());

    let json = std::fs::read(dir.path().join(format!("fdleak-{pid}-0.json"))).unwrap();
    let report: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(report["program"], "dump-signal");
    assert_eq!(report["entries"].as_array().unwrap().len(), 1);
    assert_eq!(report["entries"][0]["identity"]["addr"], 0x5a5a_0000);
    assert_eq!(dumps.spawn_failures(), 0);
}
