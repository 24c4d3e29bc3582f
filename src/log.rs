//! Structured logging for debugging maestro.
//!
//! Stdout carries the stream-json contract, so every log line goes to
//! `~/.maestro/maestro.log` instead.
//!
//! Log levels:
//! - ERROR: Run-level failures (event validation, report write)
//! - WARN: Recoverable conditions (task failures, patch conflicts, exhausted resources)
//! - INFO: Orchestration milestones (start, dispatch, concurrency changes, completion)
//! - DEBUG: Scheduler decisions and resource samples
//! - TRACE: Per-event emission
//!
//! Debug mode can be enabled with `--debug` flag or `MAESTRO_DEBUG=1` env var.
//! `MAESTRO_LOG` accepts a full `EnvFilter` directive and wins over both.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize logging to ~/.maestro/maestro.log, at debug level when
/// `debug` is set or `MAESTRO_DEBUG` asks for it.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    let filter = EnvFilter::try_from_env("MAESTRO_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let Some(dir) = log_dir() else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    // Truncate file on startup
    let _ = std::fs::write(dir.join("maestro.log"), "");

    let appender = tracing_appender::rolling::never(&dir, "maestro.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .is_ok();
    if installed {
        LOG_GUARD.set(guard).ok();
    }
}

/// Check if debug mode was requested through the environment.
pub fn env_debug() -> bool {
    std::env::var("MAESTRO_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "maestro=debug"
    } else {
        "maestro=info"
    }
}

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".maestro"))
}
