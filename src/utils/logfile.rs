//! Bounded-queue diagnostic log sink.
//!
//! Producers push records without blocking; a consumer thread batches them to
//! the dated log file and flushes on a timer and at shutdown. A full queue
//! drops records rather than stalling a real-time path.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam_queue::ArrayQueue;
use log::error;

const QUEUE_CAPACITY: usize = 4_096;
const CONSUMER_POLL: Duration = Duration::from_millis(50);

struct LogRecord {
    stamp: chrono::DateTime<Local>,
    subsystem: &'static str,
    message: String,
}

pub struct DiagLog {
    queue: Arc<ArrayQueue<LogRecord>>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl DiagLog {
    /// Opens (appending) the log file and starts the consumer thread.
    pub fn start(path: PathBuf, flush_interval: Duration) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let queue = Arc::new(ArrayQueue::<LogRecord>::new(QUEUE_CAPACITY));
        let running = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));

        let handle = {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            thread::Builder::new().name("diag-log".into()).spawn(move || {
                let mut writer = BufWriter::new(file);
                let mut last_flush = Instant::now();
                loop {
                    let mut wrote = false;
                    while let Some(rec) = queue.pop() {
                        let _ = writeln!(
                            writer,
                            "{} [{}] {}",
                            rec.stamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                            rec.subsystem,
                            rec.message
                        );
                        wrote = true;
                    }
                    let stop = !running.load(Ordering::Acquire);
                    if stop || last_flush.elapsed() >= flush_interval {
                        if writer.flush().is_err() && wrote {
                            error!("diagnostic log flush failed");
                        }
                        last_flush = Instant::now();
                    }
                    if stop && queue.is_empty() {
                        break;
                    }
                    thread::sleep(CONSUMER_POLL);
                }
                let _ = writer.flush();
            })?
        };

        Ok(Self { queue, running, dropped, handle: Some(handle) })
    }

    /// Non-blocking append; drops (and counts) when the queue is full.
    pub fn record(&self, subsystem: &'static str, message: impl Into<String>) {
        let rec = LogRecord { stamp: Local::now(), subsystem, message: message.into() };
        if self.queue.push(rec).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flushes outstanding records and joins the consumer.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for DiagLog {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_reach_disk_on_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("opentpt_test.log");
        let log = DiagLog::start(path.clone(), Duration::from_secs(30)).unwrap();
        log.record("boot", "storage mounted");
        log.record("lap", "lap 1: 108.2s");
        log.stop();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[boot] storage mounted"));
        assert!(text.contains("[lap] lap 1: 108.2s"));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn append_across_restarts() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("opentpt.log");
        {
            let log = DiagLog::start(path.clone(), Duration::from_secs(30)).unwrap();
            log.record("boot", "first run");
            log.stop();
        }
        {
            let log = DiagLog::start(path.clone(), Duration::from_secs(30)).unwrap();
            log.record("boot", "second run");
            log.stop();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("first run"));
        assert!(text.contains("second run"));
    }
}
