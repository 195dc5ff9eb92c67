//! Detector configuration
//!
//! Read once from the environment when the library is loaded. A malformed
//! value never prevents loading: it is logged and the default is kept.

use fdleak_common::{
    KindFilter, DUMP_SIGNAL, ENV_AUTOSTART, ENV_CAPACITY, ENV_EXPORT_DIR, ENV_KIND, ENV_PROGRAM,
    ENV_SIGNAL, ENV_SYMBOLIZE, MAX_LEAK_RECORDS,
};
use log::warn;
use std::path::PathBuf;

use crate::domain::ConfigError;

/// Short-lived system tools that are never instrumented
pub const IGNORED_PROGRAMS: &[&str] = &[
    "getprop", "setprop", "iptables", "ip6tables", "ip", "ln", "logcat", "sdcard", "dex2oat",
    "chmod", "insmod", "start", "stop", "chown", "toybox", "sh", "ps",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Which leak kinds are recorded
    pub kind: KindFilter,
    /// Only instrument programs whose name contains this
    pub program: Option<String>,
    /// Dump trigger
    pub signal: i32,
    /// Start tracking at load time instead of on the first trigger
    pub autostart: bool,
    /// Resolve function names for report frames
    pub symbolize: bool,
    /// Also write every dump as JSON here
    pub export_dir: Option<PathBuf>,
    /// Leak table slots
    pub capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kind: KindFilter::All,
            program: None,
            signal: DUMP_SIGNAL,
            autostart: false,
            symbolize: true,
            export_dir: None,
            capacity: MAX_LEAK_RECORDS,
        }
    }
}

impl Config {
    /// Load from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load through an arbitrary variable lookup, warning about bad values
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        apply(&lookup, ENV_KIND, parse_kind, &mut config.kind);
        apply(&lookup, ENV_SIGNAL, parse_signal, &mut config.signal);
        apply(&lookup, ENV_CAPACITY, parse_capacity, &mut config.capacity);

        config.program = lookup(ENV_PROGRAM).map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
        config.export_dir = lookup(ENV_EXPORT_DIR).filter(|d| !d.trim().is_empty()).map(PathBuf::from);
        if let Some(value) = lookup(ENV_AUTOSTART) {
            config.autostart = parse_flag(&value);
        }
        if let Some(value) = lookup(ENV_SYMBOLIZE) {
            config.symbolize = parse_flag(&value);
        }

        config
    }

    /// Whether a program with this name should be instrumented
    #[must_use]
    pub fn applies_to(&self, program: &str) -> bool {
        if IGNORED_PROGRAMS.contains(&program) {
            return false;
        }
        self.program.as_deref().map_or(true, |wanted| program.contains(wanted))
    }
}

fn apply<T: std::fmt::Debug>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: fn(&str) -> Result<T, ConfigError>,
    slot: &mut T,
) {
    let Some(value) = lookup(name) else {
        return;
    };
    match parse(&value) {
        Ok(parsed) => *slot = parsed,
        Err(e) => warn!("{name}: {e}, keeping {slot:?}"),
    }
}

/// Parse a leak kind selector
///
/// # Errors
/// Returns [`ConfigError::InvalidKind`] for anything but a kind name or `0`-`3`
pub fn parse_kind(value: &str) -> Result<KindFilter, ConfigError> {
    KindFilter::parse(value).ok_or_else(|| ConfigError::InvalidKind(value.to_string()))
}

/// Parse a dump signal number
///
/// # Errors
/// Returns [`ConfigError::InvalidSignal`] for non-numbers, numbers outside
/// `1..=SIGRTMAX`, and signals that cannot be caught
pub fn parse_signal(value: &str) -> Result<i32, ConfigError> {
    let invalid = || ConfigError::InvalidSignal(value.to_string());
    let signal: i32 = value.trim().parse().map_err(|_| invalid())?;
    if signal < 1 || signal > libc::SIGRTMAX() || signal == libc::SIGKILL || signal == libc::SIGSTOP {
        return Err(invalid());
    }
    Ok(signal)
}

/// Parse a leak table capacity
///
/// # Errors
/// Returns [`ConfigError::InvalidCapacity`] for non-numbers and zero
pub fn parse_capacity(value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(capacity) if capacity > 0 => Ok(capacity),
        _ => Err(ConfigError::InvalidCapacity(value.to_string())),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdleak_common::LeakKind;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.signal, 28);
        assert_eq!(config.capacity, 2048);
        assert!(config.symbolize);
        assert!(!config.autostart);
    }

    #[test]
    fn test_all_variables() {
        let config = config(&[
            (ENV_KIND, "socket"),
            (ENV_PROGRAM, "surfaceflinger"),
            (ENV_SIGNAL, "12"),
            (ENV_AUTOSTART, "1"),
            (ENV_SYMBOLIZE, "0"),
            (ENV_EXPORT_DIR, "/data/local/tmp"),
            (ENV_CAPACITY, "64"),
        ]);
        assert_eq!(config.kind, KindFilter::Only(LeakKind::Socket));
        assert_eq!(config.program.as_deref(), Some("surfaceflinger"));
        assert_eq!(config.signal, 12);
        assert!(config.autostart);
        assert!(!config.symbolize);
        assert_eq!(config.export_dir, Some(PathBuf::from("/data/local/tmp")));
        assert_eq!(config.capacity, 64);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config(&[(ENV_KIND, "pipes"), (ENV_SIGNAL, "9"), (ENV_CAPACITY, "0")]);
        assert_eq!(config.kind, KindFilter::All);
        assert_eq!(config.signal, DUMP_SIGNAL);
        assert_eq!(config.capacity, MAX_LEAK_RECORDS);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_kind("7"), Err(ConfigError::InvalidKind("7".to_string())));
        assert_eq!(parse_signal("abc"), Err(ConfigError::InvalidSignal("abc".to_string())));
        assert_eq!(parse_signal("0"), Err(ConfigError::InvalidSignal("0".to_string())));
        let stop = libc::SIGSTOP.to_string();
        assert_eq!(parse_signal(&stop), Err(ConfigError::InvalidSignal(stop.clone())));
        assert_eq!(parse_signal(" 10 "), Ok(10));
        assert_eq!(parse_capacity("-1"), Err(ConfigError::InvalidCapacity("-1".to_string())));
    }

    #[test]
    fn test_empty_program_filter_is_unset() {
        assert_eq!(config(&[(ENV_PROGRAM, "  ")]).program, None);
    }

    #[test]
    fn test_ignore_list_matches_exactly() {
        let config = Config::default();
        assert!(!config.applies_to("sh"));
        assert!(!config.applies_to("logcat"));
        assert!(config.applies_to("bash"));
        assert!(config.applies_to("zip"));
    }

    #[test]
    fn test_program_filter() {
        let config = config(&[(ENV_PROGRAM, "server")]);
        assert!(config.applies_to("my-server"));
        assert!(!config.applies_to("client"));
        // The ignore list wins over the filter.
        let config = Config { program: Some("p".to_string()), ..Config::default() };
        assert!(!config.applies_to("ip"));
    }
}
