//! CLI argument definitions

use clap::{Parser, Subcommand};
use fdleak::config::{parse_kind, parse_signal};
use fdleak_common::{KindFilter, DUMP_SIGNAL};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "fdleak-ctl",
    about = "Trigger and collect descriptor, socket and mapping leak reports",
    after_help = "\
EXAMPLES:
    fdleak-ctl run -- ./server --port 8080     Preload the detector, track from startup
    fdleak-ctl run --kind socket -- ./server   Track sockets only
    fdleak-ctl dump server                     Dump leaks of a running process by name
    fdleak-ctl dump --pid 1234                 Dump leaks of an explicit PID"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send the dump trigger to a process running with the detector loaded
    ///
    /// The first trigger of a process that was not started with autostart
    /// only begins tracking; later triggers write the report.
    Dump {
        /// Process name (matched against command name and executable)
        #[arg(value_name = "PROCESS")]
        process: Option<String>,

        /// Process ID
        #[arg(short, long)]
        pid: Option<i32>,

        /// Trigger signal, if the process was started with FDLEAK_SIGNAL
        #[arg(short, long, default_value_t = DUMP_SIGNAL, value_parser = signal_arg)]
        signal: i32,
    },

    /// Run a command with the detector preloaded and tracking from startup
    Run {
        /// Leak kinds to record: all, file, socket, mmap
        #[arg(short, long, default_value = "all", value_parser = kind_arg)]
        kind: KindFilter,

        /// Path to libfdleak_preload.so (default: next to this executable)
        #[arg(long, value_name = "PATH")]
        lib: Option<PathBuf>,

        /// Also write every report as JSON into this directory
        #[arg(long, value_name = "DIR")]
        export: Option<PathBuf>,

        /// Command and arguments to run
        #[arg(trailing_var_arg = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
}

fn kind_arg(value: &str) -> Result<KindFilter, String> {
    parse_kind(value).map_err(|e| e.to_string())
}

fn signal_arg(value: &str) -> Result<i32, String> {
    parse_signal(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdleak_common::LeakKind;

    #[test]
    fn test_parse_dump_by_name() {
        let args = Args::try_parse_from(["fdleak-ctl", "dump", "server"]).unwrap();
        match args.command {
            Command::Dump { process, pid, signal } => {
                assert_eq!(process.as_deref(), Some("server"));
                assert_eq!(pid, None);
                assert_eq!(signal, DUMP_SIGNAL);
            }
            Command::Run { .. } => panic!("expected dump"),
        }
    }

    #[test]
    fn test_parse_run_with_trailing_command() {
        let args =
            Args::try_parse_from(["fdleak-ctl", "run", "--kind", "socket", "--", "./server", "--port", "80"])
                .unwrap();
        match args.command {
            Command::Run { kind, command, lib, export } => {
                assert_eq!(kind, KindFilter::Only(LeakKind::Socket));
                assert_eq!(command, vec!["./server", "--port", "80"]);
                assert!(lib.is_none());
                assert!(export.is_none());
            }
            Command::Dump { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_rejects_bad_kind_and_signal() {
        assert!(Args::try_parse_from(["fdleak-ctl", "run", "--kind", "pipes", "--", "true"]).is_err());
        assert!(Args::try_parse_from(["fdleak-ctl", "dump", "--pid", "1", "--signal", "9"]).is_err());
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Args::try_parse_from(["fdleak-ctl", "run"]).is_err());
    }
}
