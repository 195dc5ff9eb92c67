//! # fdleak-ctl - Control Tool
//!
//! Two modes:
//! - **Run** (`fdleak-ctl run -- CMD...`): launch a command with the preload
//!   library and tracking enabled from startup
//! - **Dump** (`fdleak-ctl dump <PROCESS>` or `--pid <PID>`): send the dump
//!   trigger to a running process; the report goes to that process's stderr

mod args;

use anyhow::{Context, Result};
use args::{Args, Command};
use clap::Parser;
use fdleak::process_lookup::find_process_by_name;
use fdleak_common::{KindFilter, ENV_AUTOSTART, ENV_EXPORT_DIR, ENV_KIND};
use log::{debug, info};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

const PRELOAD_LIB: &str = "libfdleak_preload.so";

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("operation not permitted") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();
    match args.command {
        Command::Dump { process, pid, signal } => {
            let pid = resolve_pid(process.as_deref(), pid)?;
            send_trigger(pid, signal)?;
            println!("Sent signal {signal} to PID {pid}; the report is written to its stderr");
            Ok(EXIT_SUCCESS)
        }
        Command::Run { kind, lib, export, command } => {
            let lib = match lib {
                Some(path) => path,
                None => default_library()?,
            };
            run_preloaded(&command, &lib, kind, export.as_deref())
        }
    }
}

/// Resolve the target PID from a process name or an explicit `--pid`
fn resolve_pid(process: Option<&str>, pid: Option<i32>) -> Result<i32> {
    match (process, pid) {
        (Some(_), Some(_)) => anyhow::bail!(
            "Cannot use PROCESS argument with --pid.\n\n\
             Use either:\n  \
             fdleak-ctl dump server          (find by name)\n  \
             fdleak-ctl dump --pid 1234      (explicit PID)"
        ),
        (Some(name), None) => Ok(find_process_by_name(name)?.pid),
        (None, Some(pid)) if pid > 0 => Ok(pid),
        (None, Some(pid)) => anyhow::bail!("Invalid PID {pid}: must be positive"),
        (None, None) => anyhow::bail!(
            "Missing required argument: PROCESS or --pid\n\n\
             Usage:\n  \
             fdleak-ctl dump server          Find the process by name\n  \
             fdleak-ctl dump --pid 1234      Explicit PID\n\n\
             Run 'fdleak-ctl dump --help' for more options"
        ),
    }
}

#[allow(unsafe_code)]
fn send_trigger(pid: i32, signal: i32) -> Result<()> {
    debug!("kill({pid}, {signal})");
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } != 0 {
        let err = io::Error::last_os_error();
        return Err(err).with_context(|| format!("Failed to signal PID {pid}"));
    }
    Ok(())
}

/// `libfdleak_preload.so` next to this executable (the cargo target dir)
fn default_library() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate fdleak-ctl executable")?;
    let lib = exe.with_file_name(PRELOAD_LIB);
    if !lib.exists() {
        anyhow::bail!(
            "{} not found.\n\n\
             Build it with 'cargo build -p fdleak-preload' or pass --lib <PATH>",
            lib.display()
        );
    }
    Ok(lib)
}

/// `LD_PRELOAD` value with `lib` ahead of anything already preloaded
fn preload_value(lib: &Path, existing: Option<OsString>) -> OsString {
    let mut value = lib.as_os_str().to_os_string();
    if let Some(existing) = existing.filter(|e| !e.is_empty()) {
        value.push(":");
        value.push(existing);
    }
    value
}

fn run_preloaded(command: &[String], lib: &Path, kind: KindFilter, export: Option<&Path>) -> Result<i32> {
    let (program, rest) = command
        .split_first()
        .context("Missing required argument: COMMAND")?;
    let lib = std::fs::canonicalize(lib)
        .with_context(|| format!("Failed to resolve path: {}", lib.display()))?;

    let mut child = std::process::Command::new(program);
    child
        .args(rest)
        .env("LD_PRELOAD", preload_value(&lib, std::env::var_os("LD_PRELOAD")))
        .env(ENV_AUTOSTART, "1")
        .env(ENV_KIND, kind.to_string());
    if let Some(dir) = export {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create export directory: {}", dir.display()))?;
        child.env(ENV_EXPORT_DIR, dir);
    }

    let mut child = child.spawn().with_context(|| format!("Failed to start {program}"))?;
    info!(
        "Started {program} as PID {pid}; run 'fdleak-ctl dump --pid {pid}' to report leaks",
        pid = child.id()
    );
    let status = child.wait().with_context(|| format!("Failed to wait for {program}"))?;
    debug!("{program} exited with {status}");
    Ok(status.code().unwrap_or(EXIT_ERROR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let denied = Err::<(), _>(io::Error::from_raw_os_error(libc::EPERM))
            .context("Failed to signal PID 1")
            .unwrap_err();
        assert_eq!(exit_code_for(&denied), EXIT_NOPERM);
        assert_eq!(exit_code_for(&resolve_pid(None, None).unwrap_err()), EXIT_USAGE);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), EXIT_ERROR);
    }

    #[test]
    fn test_resolve_pid_modes() {
        assert_eq!(resolve_pid(None, Some(42)).unwrap(), 42);
        assert!(resolve_pid(Some("server"), Some(42)).is_err());
        assert!(resolve_pid(None, Some(0)).is_err());
        assert!(resolve_pid(Some("fdleak-no-such-process-xyz"), None).is_err());
    }

    #[test]
    fn test_preload_value_prepends() {
        let lib = Path::new("/opt/libfdleak_preload.so");
        assert_eq!(preload_value(lib, None), OsString::from("/opt/libfdleak_preload.so"));
        assert_eq!(preload_value(lib, Some(OsString::new())), OsString::from("/opt/libfdleak_preload.so"));
        assert_eq!(
            preload_value(lib, Some(OsString::from("/lib/other.so"))),
            OsString::from("/opt/libfdleak_preload.so:/lib/other.so")
        );
    }

    #[test]
    fn test_signal_to_self_with_null_signal() {
        let pid = i32::try_from(std::process::id()).unwrap();
        send_trigger(pid, 0).unwrap();
    }

    #[test]
    fn test_signal_missing_process_fails() {
        assert!(send_trigger(i32::MAX, 0).is_err());
    }
}
