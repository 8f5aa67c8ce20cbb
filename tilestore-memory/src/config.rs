use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::errors::{ErrorKind, MemoryError, MemoryResult};

/// Parameter key naming the reporter's output file.
pub const REPORTER_FILENAME_KEY: &str = "sm.memory.tracker.reporter.filename";
/// Parameter key for the reporter's wait time, in milliseconds.
pub const REPORTER_WAIT_TIME_KEY: &str = "sm.memory.tracker.reporter.wait_time_ms";
/// Default wait between two reports.
pub const DEFAULT_REPORTER_WAIT_TIME_MS: u64 = 1000;
/// Shortest wait the reporter accepts.
pub const MIN_REPORTER_WAIT_TIME_MS: u64 = 1;

/// Settings for [`MemoryTrackerReporter`](crate::reporter::MemoryTrackerReporter).
///
/// Cheap to clone; clones share the same settings. The reporter reads the
/// settings once, when it starts.
#[derive(Clone)]
pub struct MemoryTrackerReporterConfig {
    inner: Arc<ReporterConfigInner>,
}

struct ReporterConfigInner {
    filename: RwLock<Option<PathBuf>>,
    wait_time_ms: AtomicU64,
}

impl MemoryTrackerReporterConfig {
    /// No output file and a one second wait.
    pub fn new() -> Self {
        MemoryTrackerReporterConfig {
            inner: Arc::new(ReporterConfigInner {
                filename: RwLock::new(None),
                wait_time_ms: AtomicU64::new(DEFAULT_REPORTER_WAIT_TIME_MS),
            }),
        }
    }

    /// Reads the reporter keys out of a flat parameter map.
    ///
    /// Unknown keys are ignored. An empty filename leaves the reporter
    /// disabled. A wait time of 0 is rejected.
    pub fn from_params(params: &HashMap<String, String>) -> MemoryResult<Self> {
        let config = MemoryTrackerReporterConfig::new();
        if let Some(filename) = params.get(REPORTER_FILENAME_KEY) {
            if !filename.is_empty() {
                config.set_filename(filename);
            }
        }
        if let Some(wait_time) = params.get(REPORTER_WAIT_TIME_KEY) {
            let wait_time_ms = wait_time.trim().parse::<u64>()?;
            if wait_time_ms < MIN_REPORTER_WAIT_TIME_MS {
                return Err(MemoryError::new(
                    &format!(
                        "Invalid {}: {}; must be at least {} ms",
                        REPORTER_WAIT_TIME_KEY, wait_time_ms, MIN_REPORTER_WAIT_TIME_MS
                    ),
                    ErrorKind::InvalidConfiguration,
                ));
            }
            config.set_wait_time_ms(wait_time_ms);
        }
        Ok(config)
    }

    pub fn filename(&self) -> Option<PathBuf> {
        self.inner.filename.read().clone()
    }

    pub fn set_filename<P: AsRef<Path>>(&self, filename: P) {
        *self.inner.filename.write() = Some(filename.as_ref().to_path_buf());
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.inner.wait_time_ms.load(Ordering::Relaxed))
    }

    /// Values below [`MIN_REPORTER_WAIT_TIME_MS`] are raised to it.
    pub fn set_wait_time_ms(&self, wait_time_ms: u64) {
        self.inner
            .wait_time_ms
            .store(wait_time_ms.max(MIN_REPORTER_WAIT_TIME_MS), Ordering::Relaxed);
    }

    pub fn with_filename<P: AsRef<Path>>(self, filename: P) -> Self {
        self.set_filename(filename);
        self
    }

    pub fn with_wait_time_ms(self, wait_time_ms: u64) -> Self {
        self.set_wait_time_ms(wait_time_ms);
        self
    }
}

impl Default for MemoryTrackerReporterConfig {
    fn default() -> Self {
        MemoryTrackerReporterConfig::new()
    }
}
