//! Immutable sample record handed from producers to the renderer.

use std::time::Instant;

/// One producer sample plus publish metadata.
///
/// Published snapshots are never mutated; consumers hold them only through
/// `Arc` and observe a fully-constructed value or nothing.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub payload: T,
    pub publish_ts: Instant,
    pub seq: u64,
}

impl<T> Snapshot<T> {
    pub fn new(payload: T, seq: u64) -> Self {
        Self { payload, publish_ts: Instant::now(), seq }
    }

    /// Age of this snapshot relative to `now`.
    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.publish_ts)
    }
}
