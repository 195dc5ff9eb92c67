//! Process names and PID lookup through `/proc`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Result of process lookup.
#[derive(Debug)]
pub struct ProcessInfo {
    pub pid: i32,
    pub exe_path: PathBuf,
    pub command: String,
}

/// Find a process by name.
///
/// Matches against the command name from `/proc/<pid>/stat` and the
/// executable basename from `/proc/<pid>/exe`. The calling process itself
/// is never a match.
///
/// # Errors
/// - No processes found
/// - Multiple processes found (ambiguous)
pub fn find_process_by_name(name: &str) -> Result<ProcessInfo> {
    let own_pid = std::process::id();
    let mut matches: Vec<ProcessInfo> = Vec::new();

    let proc_dir = fs::read_dir("/proc").context("Failed to read /proc")?;

    for entry in proc_dir.flatten() {
        let file_name = entry.file_name();
        let pid_str = file_name.to_string_lossy();

        let Ok(pid) = pid_str.parse::<i32>() else {
            continue;
        };
        if u32::try_from(pid).is_ok_and(|p| p == own_pid) {
            continue;
        }

        // Skip kernel threads and inaccessible processes
        let Ok(exe_path) = fs::read_link(format!("/proc/{pid}/exe")) else {
            continue;
        };

        let Ok(stat_content) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };

        let Ok(command) = extract_comm(&stat_content) else {
            continue;
        };

        if is_match(&command, &exe_path, name) {
            matches.push(ProcessInfo { pid, exe_path, command });
        }
    }

    match matches.len() {
        0 => bail!(
            "No process matching '{name}' found.\n\
             Check running processes with: ps aux | grep {name}"
        ),
        1 => Ok(matches.remove(0)),
        _ => {
            let list: Vec<String> =
                matches.iter().map(|m| format!("  {} ({})", m.pid, m.command)).collect();
            bail!(
                "Multiple processes match '{name}':\n{}\n\n\
                 Specify PID explicitly: fdleak-ctl dump --pid <PID>",
                list.join("\n")
            )
        }
    }
}

/// Name of the calling program: basename of `argv[0]`, falling back to the
/// kernel's command name.
#[must_use]
pub fn current_program_name() -> String {
    fs::read("/proc/self/cmdline")
        .ok()
        .and_then(|cmdline| program_name_from_cmdline(&cmdline))
        .or_else(|| fs::read_to_string("/proc/self/stat").ok().and_then(|s| extract_comm(&s).ok()))
        .unwrap_or_else(|| "<unknown>".to_string())
}

/// Basename of the first NUL-separated argument.
fn program_name_from_cmdline(cmdline: &[u8]) -> Option<String> {
    let argv0 = cmdline.split(|&b| b == 0).next()?;
    if argv0.is_empty() {
        return None;
    }
    let lossy = String::from_utf8_lossy(argv0);
    let path: &str = &lossy;
    let name = Path::new(path).file_name().and_then(|n| n.to_str()).unwrap_or(path);
    Some(name.to_string())
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}

/// Check if process matches the search pattern.
fn is_match(command: &str, exe_path: &Path, pattern: &str) -> bool {
    let exe_basename = exe_path.file_name().and_then(|n| n.to_str()).unwrap_or("");

    let pattern_basename = Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);

    // Exact match on command or exe basename
    command == pattern_basename
        || exe_basename == pattern_basename
        // Substring match for flexibility
        || command.contains(pattern)
        || exe_basename.contains(pattern)
}
