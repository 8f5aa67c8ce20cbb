use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde_json::json;

use crate::config::MemoryTrackerReporterConfig;
use crate::errors::{ErrorKind, MemoryError, MemoryResult};
use crate::manager::MemoryTrackerManager;

struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        StopSignal {
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn raise(&self) {
        *self.stopped.lock() = true;
        self.condvar.notify_all();
    }
}

/// A running reporter thread and the signal that stops it. Every start
/// creates its own signal.
struct Worker {
    handle: JoinHandle<()>,
    signal: Arc<StopSignal>,
}

/// Background thread that periodically appends the manager's tracker
/// snapshot to a file, one JSON object per line.
///
/// The thread only runs when the config names a file. Dropping the reporter
/// stops and joins the thread.
pub struct MemoryTrackerReporter {
    manager: Arc<MemoryTrackerManager>,
    config: MemoryTrackerReporterConfig,
    thread: Mutex<Option<Worker>>,
}

impl MemoryTrackerReporter {
    pub fn new(manager: Arc<MemoryTrackerManager>, config: MemoryTrackerReporterConfig) -> Self {
        MemoryTrackerReporter {
            manager,
            config,
            thread: Mutex::new(None),
        }
    }

    /// Starts the reporting thread. Does nothing if no filename is configured
    /// or the thread is already running.
    pub fn start(&self) -> MemoryResult<()> {
        let filename = match self.config.filename() {
            Some(filename) => filename,
            None => {
                log::debug!("Memory tracker reporter has no output file; not starting");
                return Ok(());
            }
        };

        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        let signal = Arc::new(StopSignal::new());
        let manager = Arc::clone(&self.manager);
        let thread_signal = Arc::clone(&signal);
        let wait_time = self.config.wait_time();

        let handle = std::thread::Builder::new()
            .name("memory-tracker-reporter".to_string())
            .spawn(move || run(manager, filename, wait_time, thread_signal))
            .map_err(|err| {
                MemoryError::new(
                    &format!("Failed to start memory tracker reporter: {}", err),
                    ErrorKind::InternalError,
                )
            })?;
        *thread = Some(Worker { handle, signal });
        log::debug!("Memory tracker reporter started");
        Ok(())
    }

    /// Signals the thread to stop and waits for it. Safe to call repeatedly
    /// and from any thread.
    pub fn stop(&self) {
        let handle = {
            let mut thread = self.thread.lock();
            match thread.take() {
                Some(worker) => {
                    worker.signal.raise();
                    worker.handle
                }
                None => return,
            }
        };

        if handle.join().is_err() {
            log::error!("Memory tracker reporter thread panicked");
        }
        log::debug!("Memory tracker reporter stopped");
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }
}

impl Drop for MemoryTrackerReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    manager: Arc<MemoryTrackerManager>,
    filename: PathBuf,
    wait_time: Duration,
    signal: Arc<StopSignal>,
) {
    let mut stopped = signal.stopped.lock();
    loop {
        if !*stopped {
            signal.condvar.wait_for(&mut stopped, wait_time);
        }
        if *stopped {
            break;
        }

        MutexGuard::unlocked(&mut stopped, || {
            if let Err(err) = write_report(&manager, &filename) {
                log::error!(
                    "Failed to write memory report to {}: {}",
                    filename.display(),
                    err
                );
            }
        });
    }
}

fn write_report(manager: &MemoryTrackerManager, filename: &Path) -> MemoryResult<()> {
    let line = json!({
        "timestamp_ms": chrono::Utc::now().timestamp_millis(),
        "memory": manager.snapshot()?,
    });

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)?;
    file.write_all(format!("{}\n", line).as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_type::MemoryType;
    use crate::pmr;
    use std::fs;
    use std::time::Instant;
    use test_retry::retry;

    #[ctor::ctor]
    fn init() {
        colog::init();
    }

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    #[test]
    fn does_not_start_without_filename() {
        let manager = Arc::new(MemoryTrackerManager::new());
        let reporter = MemoryTrackerReporter::new(manager, MemoryTrackerReporterConfig::new());
        reporter.start().unwrap();
        assert!(!reporter.is_running());
        reporter.stop();
    }

    #[test]
    #[retry]
    fn writes_json_lines_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.jsonl");

        let manager = Arc::new(MemoryTrackerManager::new());
        let tracker = manager.create_tracker();
        let _buffer =
            pmr::Vec::<u8>::with_capacity_in(16, tracker.get_allocator(MemoryType::RTree))
                .unwrap();

        let config = MemoryTrackerReporterConfig::new()
            .with_filename(&path)
            .with_wait_time_ms(10);
        let reporter = MemoryTrackerReporter::new(manager, config);
        reporter.start().unwrap();
        assert!(reporter.is_running());

        awaitility::at_most(Duration::from_secs(5)).until(|| read_lines(&path).len() >= 2);
        reporter.stop();

        let lines = read_lines(&path);
        let first = &lines[0];
        assert!(first["timestamp_ms"].as_i64().unwrap() > 0);
        let memory = first["memory"].as_array().unwrap();
        assert_eq!(memory.len(), 1);
        assert_eq!(memory[0]["tracker_id"], tracker.get_id().to_string());
        assert_eq!(memory[0]["counters"]["RTree"], 16);
    }

    #[test]
    fn start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryTrackerReporterConfig::new()
            .with_filename(dir.path().join("report.jsonl"))
            .with_wait_time_ms(1000);
        let reporter = MemoryTrackerReporter::new(Arc::new(MemoryTrackerManager::new()), config);
        reporter.start().unwrap();
        reporter.start().unwrap();
        assert!(reporter.is_running());
        reporter.stop();
        assert!(!reporter.is_running());
    }

    #[test]
    #[retry]
    fn stop_wakes_the_thread_early() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryTrackerReporterConfig::new()
            .with_filename(dir.path().join("report.jsonl"))
            .with_wait_time_ms(60_000);
        let reporter = MemoryTrackerReporter::new(Arc::new(MemoryTrackerManager::new()), config);
        reporter.start().unwrap();

        let started = Instant::now();
        reporter.stop();
        reporter.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stop_from_another_thread() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryTrackerReporterConfig::new()
            .with_filename(dir.path().join("report.jsonl"))
            .with_wait_time_ms(20);
        let reporter = Arc::new(MemoryTrackerReporter::new(
            Arc::new(MemoryTrackerManager::new()),
            config,
        ));
        reporter.start().unwrap();

        let remote = Arc::clone(&reporter);
        std::thread::spawn(move || remote.stop()).join().unwrap();
        assert!(!reporter.is_running());
    }

    #[test]
    fn drop_joins_the_thread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.jsonl");
        {
            let config = MemoryTrackerReporterConfig::new()
                .with_filename(&path)
                .with_wait_time_ms(5);
            let reporter =
                MemoryTrackerReporter::new(Arc::new(MemoryTrackerManager::new()), config);
            reporter.start().unwrap();
            awaitility::at_most(Duration::from_secs(5)).until(|| path.exists());
        }
        let before = read_lines(&path).len();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(read_lines(&path).len(), before);
    }

    #[test]
    fn unwritable_file_keeps_thread_alive() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryTrackerReporterConfig::new()
            .with_filename(dir.path().join("missing").join("report.jsonl"))
            .with_wait_time_ms(5);
        let reporter = MemoryTrackerReporter::new(Arc::new(MemoryTrackerManager::new()), config);
        reporter.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(reporter.is_running());
        reporter.stop();
    }

    #[test]
    fn concurrent_start_and_stop_leave_no_thread_behind() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryTrackerReporterConfig::new()
            .with_filename(dir.path().join("report.jsonl"))
            .with_wait_time_ms(5);
        let reporter = MemoryTrackerReporter::new(Arc::new(MemoryTrackerManager::new()), config);

        std::thread::scope(|scope| {
            for i in 0..8 {
                let reporter = &reporter;
                scope.spawn(move || {
                    for _ in 0..50 {
                        if i % 2 == 0 {
                            reporter.start().unwrap();
                        } else {
                            reporter.stop();
                        }
                    }
                });
            }
        });

        let started = Instant::now();
        reporter.stop();
        assert!(!reporter.is_running());
        assert!(started.elapsed() < Duration::from_secs(5));

        reporter.start().unwrap();
        assert!(reporter.is_running());
        reporter.stop();
        assert!(!reporter.is_running());
    }
}
