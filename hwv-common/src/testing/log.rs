//! Tracing capture for tests.
//!
//! [`init_global_test_logging`] is meant to run once per test binary from a
//! `#[ctor::ctor]` hook. Events go to the libtest writer in compact form and,
//! as JSON lines, to `target/test-logs/hwv_tests.jsonl` so a failing CI run
//! can be read back afterwards.

use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::Instant;
use tracing_subscriber::prelude::*;

static INIT: Once = Once::new();

/// Install the test subscriber. Later calls do nothing.
///
/// `HWV_TEST_LOG_LEVEL` sets the level (default `info`) and
/// `HWV_TEST_LOG_FILE` moves the JSONL file.
pub fn init_global_test_logging() {
    INIT.call_once(|| {
        let level = std::env::var("HWV_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "hwv={level},hwv_common={level},test={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let json_layer = open_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_thread_ids(true)
                .with_line_number(true)
        });
        let console_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .compact();

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(json_layer)
            .with(console_layer)
            .try_init();
    });
}

fn open_log_file() -> Option<std::fs::File> {
    let path = match std::env::var("HWV_TEST_LOG_FILE") {
        Ok(custom) => PathBuf::from(custom),
        Err(_) => log_dir().join("hwv_tests.jsonl"),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
}

/// `{target}/test-logs`, from `CARGO_TARGET_DIR` or the nearest `target/` above the cwd.
fn log_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(dir).join("test-logs");
    }
    let cwd = std::env::current_dir().unwrap_or_default();
    cwd.ancestors()
        .map(|dir| dir.join("target"))
        .find(|target| target.is_dir())
        .unwrap_or_else(|| PathBuf::from("target"))
        .join("test-logs")
}

/// Brackets a test with START and PASS/FAIL events on the `test` target.
///
/// FAIL is logged when the guard drops during a panic.
pub struct TestGuard {
    name: &'static str,
    started: Instant,
}

impl TestGuard {
    pub fn new(name: &'static str) -> Self {
        init_global_test_logging();
        tracing::info!(target: "test", test = name, "TEST START");
        Self {
            name,
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        let elapsed_ms = self.elapsed_ms();
        if std::thread::panicking() {
            tracing::error!(target: "test", test = self.name, elapsed_ms, "TEST FAIL");
        } else {
            tracing::info!(target: "test", test = self.name, elapsed_ms, "TEST PASS");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        init_global_test_logging();
        init_global_test_logging();
    }

    #[test]
    fn test_guard_measures_elapsed() {
        let guard = TestGuard::new("test_guard_measures_elapsed");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(guard.elapsed_ms() >= 5);
    }

    #[test]
    fn test_log_dir_ends_in_test_logs() {
        assert!(log_dir().ends_with("test-logs"));
    }
}
