//! Structured error types for fdleak
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! None of these ever reach the instrumented program: the interception layer
//! swallows them and degrades to "stop tracking accurately".

use super::types::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Failed to read /proc/{0}/maps")]
    MemoryMapsParseFailed(Pid),

    #[error("No mapping in process {pid} contains address 0x{addr:x}")]
    NoRegionForAddress { pid: Pid, addr: u64 },

    #[error("A detector is already installed in this process")]
    AlreadyInstalled,

    #[error("Unable to install handler for signal {signal}: {source}")]
    SignalHandler {
        signal: i32,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid leak kind {0:?} (expected all, file, socket, mmap or 0-3)")]
    InvalidKind(String),

    #[error("Invalid signal number {0:?}")]
    InvalidSignal(String),

    #[error("Invalid table capacity {0:?}")]
    InvalidCapacity(String),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write dump file {path}: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
