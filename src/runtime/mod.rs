//! Producer/consumer fabric between sensor workers and the renderer.
//!
//! Each hardware source owns one worker thread which publishes immutable
//! snapshots into a depth-2 bounded queue; the renderer reads the most recent
//! snapshot through a wait-free slot without ever blocking a producer.

mod backoff;
mod handler;
mod slot;
mod snapshot;

pub use backoff::ExponentialBackoff;
pub use handler::{Handler, HandlerError, HandlerState, Publisher, Worker, HANDLER_STOP_TIMEOUT};
pub use slot::SnapshotSlot;
pub use snapshot::Snapshot;

/// Scripted-worker test support: a publisher over a bare slot.
#[cfg(test)]
pub(crate) fn test_publisher<T>(slot: std::sync::Arc<SnapshotSlot<T>>) -> Publisher<T> {
    Publisher::from_slot(slot)
}
