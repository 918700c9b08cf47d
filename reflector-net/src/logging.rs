//! Structured logging init, mirroring the teacher's `flux::logging`: a root `slog::Logger` is
//! built once from a small declarative config and handed down by reference to every
//! constructor that needs it, rather than reached for through a global.

pub use slog::{debug, error, info, o, trace, warn, Logger};

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::Path;

/// Builds the root logger for the process. `level` follows the usual trace/debug/info/warn/error
/// naming; unrecognized values fall back to `info`.
pub fn init(level: &str, to_stderr: bool) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(parse_level(level));
    builder.destination(if to_stderr {
        Destination::Stderr
    } else {
        Destination::Stdout
    });

    builder.build().expect("failed to initialize logging")
}

/// Builds the root logger writing to `path` instead of a terminal, for the `--logfile` CLI flag.
pub fn init_file(level: &str, path: &Path) -> Logger {
    let mut builder = FileLoggerBuilder::new(path);
    builder.level(parse_level(level));
    builder.build().expect("failed to initialize file logging")
}

fn parse_level(level: &str) -> Severity {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "warn" | "warning" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    }
}
