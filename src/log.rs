//! Structured logging setup.
//!
//! Log levels:
//! - ERROR: Failures that abort a run (graph errors, resume mismatches)
//! - WARN: Item failures, stalls, critical aborts
//! - INFO: Run and stage lifecycle
//! - DEBUG: Dispatch, checkpoint I/O and heartbeat traffic
//! - TRACE: Per-poll monitor state
//!
//! Output goes to `~/.stagehand/stagehand.log`, truncated on startup.
//! Debug mode can be enabled with `--debug` or `STAGEHAND_DEBUG=1`;
//! `STAGEHAND_LOG` takes a full `EnvFilter` directive and wins over both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

use crate::config::Config;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

pub const DEBUG_ENV: &str = "STAGEHAND_DEBUG";
pub const FILTER_ENV: &str = "STAGEHAND_LOG";

/// Initialize logging with debug mode off.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);
    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let directive = filter_directive(debug_enabled, std::env::var(FILTER_ENV).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(file) = open_log_file() else {
        // No writable state dir: fall back to stderr.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .try_init();
}

fn open_log_file() -> Option<File> {
    let dir = Config::stagehand_dir().ok()?;
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("stagehand.log");
    let file = File::create(&path).ok()?;
    LOG_PATH.set(path).ok();
    Some(file)
}

/// Resolve the filter directive from debug mode and an optional override.
pub fn filter_directive(debug: bool, env_override: Option<String>) -> String {
    match env_override {
        Some(directive) if !directive.trim().is_empty() => directive,
        _ if debug => "stagehand=debug,info".to_string(),
        _ => "info".to_string(),
    }
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the active log file, if file logging was set up.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}
