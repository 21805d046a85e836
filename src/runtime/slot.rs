//! Depth-2 bounded queue with a wait-free "latest" reference.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use crossbeam_queue::ArrayQueue;

use super::snapshot::Snapshot;

pub const QUEUE_DEPTH: usize = 2;

/// Single-producer/single-consumer snapshot channel for one source.
///
/// `publish` enqueues and then swaps the latest reference, so a concurrent
/// `latest` observes either the previous snapshot or the new one, never a torn
/// value and never one older than a just-dropped entry. When the queue is
/// full the oldest snapshot is displaced and counted in `frames_dropped`.
pub struct SnapshotSlot<T> {
    queue: ArrayQueue<Arc<Snapshot<T>>>,
    latest: ArcSwapOption<Snapshot<T>>,
    next_seq: AtomicU64,
    frames_dropped: AtomicU64,
    // Publish instants as nanoseconds since `epoch`, for update-rate derivation.
    last_publish_ns: AtomicU64,
    prev_publish_ns: AtomicU64,
    epoch: Instant,
}

impl<T> SnapshotSlot<T> {
    pub fn new() -> Self {
        Self {
            queue: ArrayQueue::new(QUEUE_DEPTH),
            latest: ArcSwapOption::const_empty(),
            next_seq: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            last_publish_ns: AtomicU64::new(0),
            prev_publish_ns: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Publishes a new snapshot, returning its sequence number.
    pub fn publish(&self, payload: T) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let snap = Arc::new(Snapshot::new(payload, seq));

        if self.queue.force_push(Arc::clone(&snap)).is_some() {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }

        let now_ns = self.epoch.elapsed().as_nanos() as u64;
        let prev = self.last_publish_ns.swap(now_ns, Ordering::Relaxed);
        self.prev_publish_ns.store(prev, Ordering::Relaxed);

        self.latest.store(Some(snap));
        seq
    }

    /// Most recently published snapshot, or `None` before the first publish.
    ///
    /// Wait-free: a single atomic pointer load plus a refcount bump.
    pub fn latest(&self) -> Option<Arc<Snapshot<T>>> {
        self.latest.load_full()
    }

    /// Dequeues the oldest undelivered snapshot (consumer side).
    pub fn pop(&self) -> Option<Arc<Snapshot<T>>> {
        self.queue.pop()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }

    /// Publish rate derived from the two most recent publish instants.
    pub fn update_rate_hz(&self) -> f32 {
        let last = self.last_publish_ns.load(Ordering::Relaxed);
        let prev = self.prev_publish_ns.load(Ordering::Relaxed);
        if prev == 0 || last <= prev {
            return 0.0;
        }
        1e9 / (last - prev) as f32
    }
}

impl<T> Default for SnapshotSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn latest_is_none_before_first_publish() {
        let slot: SnapshotSlot<u32> = SnapshotSlot::new();
        assert!(slot.latest().is_none());
        assert_eq!(slot.update_rate_hz(), 0.0);
    }

    #[test]
    fn publish_makes_value_visible() {
        let slot = SnapshotSlot::new();
        slot.publish(7u32);
        let snap = slot.latest().expect("snapshot");
        assert_eq!(snap.payload, 7);
        assert_eq!(snap.seq, 0);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let slot = SnapshotSlot::new();
        slot.publish(1u32);
        slot.publish(2);
        slot.publish(3); // displaces 1

        assert_eq!(slot.frames_dropped(), 1);
        assert_eq!(slot.pop().unwrap().payload, 2);
        assert_eq!(slot.pop().unwrap().payload, 3);
        assert!(slot.pop().is_none());
        // Latest still serves the newest value after the queue drained.
        assert_eq!(slot.latest().unwrap().payload, 3);
    }

    #[test]
    fn at_most_two_snapshots_queued() {
        let slot = SnapshotSlot::new();
        for i in 0..100u32 {
            slot.publish(i);
        }
        let mut live = 0;
        while slot.pop().is_some() {
            live += 1;
        }
        assert!(live <= QUEUE_DEPTH);
        assert_eq!(slot.frames_dropped(), 98);
    }

    #[test]
    fn latest_seq_is_monotonic_under_concurrent_publish() {
        let slot = Arc::new(SnapshotSlot::new());
        let producer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                for i in 0..10_000u64 {
                    slot.publish(i);
                }
            })
        };

        let mut last_seq = 0u64;
        for _ in 0..10_000 {
            if let Some(snap) = slot.latest() {
                assert!(snap.seq >= last_seq, "seq went backwards");
                assert_eq!(snap.payload, snap.seq, "torn snapshot");
                last_seq = snap.seq;
            }
        }
        producer.join().unwrap();
        assert_eq!(slot.latest().unwrap().seq, 9_999);
    }

    #[test]
    fn update_rate_tracks_publish_interval() {
        let slot = SnapshotSlot::new();
        slot.publish(0u32);
        thread::sleep(std::time::Duration::from_millis(20));
        slot.publish(1);
        let hz = slot.update_rate_hz();
        assert!(hz > 10.0 && hz < 100.0, "rate {hz}");
    }
}
