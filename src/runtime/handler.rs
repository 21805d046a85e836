//! Worker lifecycle harness shared by every sensor handler.
//!
//! A handler owns exactly one producer thread driving one device. Read errors
//! stay local: the loop logs at the configured failure counts and backs off;
//! only init errors surface to the orchestrator, which records the source as
//! absent and keeps booting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thiserror::Error;

use super::backoff::ExponentialBackoff;
use super::slot::SnapshotSlot;
use super::snapshot::Snapshot;

/// Workers must observe the stop flag at least this often; device calls that
/// can block longer are wrapped in timeouts below this bound.
pub const HANDLER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("device: {0}")]
    Device(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("init: {0}")]
    Init(String),
    #[error("bus timeout")]
    BusTimeout,
    #[error("device disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Uninitialised,
    Running,
    Stopped,
}

/// Publish-only view of a handler's snapshot slot, handed to the worker.
pub struct Publisher<T> {
    slot: Arc<SnapshotSlot<T>>,
}

impl<T> Publisher<T> {
    pub fn publish(&self, payload: T) -> u64 {
        self.slot.publish(payload)
    }

    #[cfg(test)]
    pub(crate) fn from_slot(slot: Arc<SnapshotSlot<T>>) -> Self {
        Self { slot }
    }
}

/// One producer iteration over a device.
///
/// `poll` blocks only inside its own timeout-wrapped device call. Returning
/// `Ok` without publishing is fine (nothing arrived inside the window);
/// returning `Err` engages the backoff policy.
pub trait Worker: Send + 'static {
    type Payload: Send + Sync + 'static;

    /// Called once on the worker thread before the loop. A failure leaves the
    /// handler degraded: the thread exits and `latest()` stays `None`.
    fn init(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }

    fn poll(&mut self, out: &Publisher<Self::Payload>) -> Result<(), HandlerError>;

    fn on_stop(&mut self) {}

    /// Retry governor for this source. Overridable for fast-cadence tests.
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::default()
    }
}

/// Owner of one device worker: thread handle, stop flag and snapshot slot.
pub struct Handler<T> {
    name: &'static str,
    slot: Arc<SnapshotSlot<T>>,
    running: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    launch: Option<Box<dyn FnOnce() -> JoinHandle<()> + Send>>,
    state: HandlerState,
}

impl<T: Send + Sync + 'static> Handler<T> {
    pub fn new<W: Worker<Payload = T>>(name: &'static str, worker: W) -> Self {
        let slot = Arc::new(SnapshotSlot::new());
        let running = Arc::new(AtomicBool::new(false));
        let degraded = Arc::new(AtomicBool::new(false));

        let launch: Box<dyn FnOnce() -> JoinHandle<()> + Send> = {
            let slot = Arc::clone(&slot);
            let running = Arc::clone(&running);
            let degraded = Arc::clone(&degraded);
            Box::new(move || {
                thread::Builder::new()
                    .name(name.to_string())
                    .spawn(move || worker_loop(name, worker, slot, running, degraded))
                    .unwrap_or_else(|e| panic!("spawn {name}: {e}"))
            })
        };

        Self {
            name,
            slot,
            running,
            degraded,
            join: None,
            launch: Some(launch),
            state: HandlerState::Uninitialised,
        }
    }

    /// Spawns the worker thread. Idempotent while running.
    pub fn start(&mut self) {
        if self.state == HandlerState::Running {
            return;
        }
        if let Some(launch) = self.launch.take() {
            self.running.store(true, Ordering::Release);
            self.join = Some(launch());
            self.state = HandlerState::Running;
            info!("[{}] started", self.name);
        } else {
            warn!("[{}] start after stop ignored", self.name);
        }
    }

    /// Signals the worker to exit and joins it within `timeout`.
    ///
    /// Returns `false` when the thread did not finish in time and was
    /// abandoned (detached).
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::Release);
        self.state = HandlerState::Stopped;

        let Some(handle) = self.join.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                error!("[{}] worker did not stop within {:?}; abandoning", self.name, timeout);
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = handle.join();
        debug!("[{}] stopped", self.name);
        true
    }

    /// Most recent snapshot; wait-free, never blocks the render loop.
    pub fn latest(&self) -> Option<Arc<Snapshot<T>>> {
        self.slot.latest()
    }

    /// Dequeues the oldest undelivered snapshot.
    pub fn pop(&self) -> Option<Arc<Snapshot<T>>> {
        self.slot.pop()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// True when init failed and the source will never publish.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn update_rate_hz(&self) -> f32 {
        self.slot.update_rate_hz()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.slot.frames_dropped()
    }

    pub fn published(&self) -> u64 {
        self.slot.published()
    }
}

impl<T> Drop for Handler<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

fn worker_loop<W: Worker>(
    name: &'static str,
    mut worker: W,
    slot: Arc<SnapshotSlot<W::Payload>>,
    running: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
) {
    if let Err(e) = worker.init() {
        error!("[{name}] init failed, source absent: {e}");
        degraded.store(true, Ordering::Relaxed);
        return;
    }

    let out = Publisher { slot };
    let mut backoff = worker.backoff();

    while running.load(Ordering::Acquire) {
        match worker.poll(&out) {
            Ok(()) => {
                if backoff.on_success() {
                    info!("[{name}] recovered after failure streak");
                }
            }
            Err(HandlerError::Disconnected) => {
                error!("[{name}] device disconnected; worker exiting");
                degraded.store(true, Ordering::Relaxed);
                break;
            }
            Err(e) => {
                let n = backoff.on_failure();
                if ExponentialBackoff::should_log(n) {
                    warn!("[{name}] read failure #{n}: {e}");
                }
                sleep_while_running(&running, backoff.current_delay());
            }
        }
    }

    worker.on_stop();
    debug!("[{name}] worker loop exited");
}

/// Sleeps up to `total` in short slices so a stop request is honoured promptly.
fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}
