//! UI input events dispatched to the renderer.
//!
//! Button and menu input arrives from the I²C input worker (or a test
//! script) over a bounded channel; the render loop drains it once per frame
//! and maps each event onto engine or handler calls.

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};

use crate::handlers::camera::CameraId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    NextPage,
    PrevPage,
    /// Mark the pit entry line at the current position and heading.
    MarkPitEntry,
    MarkPitExit,
    TogglePitMode,
    ToggleCopilot,
    SelectCamera(CameraId),
    BrightnessUp,
    BrightnessDown,
    RecalibrateImu,
    ExportSession,
    Shutdown,
}

const EVENT_QUEUE_DEPTH: usize = 32;

pub fn event_channel() -> (EventSender, Receiver<AppEvent>) {
    let (tx, rx) = bounded(EVENT_QUEUE_DEPTH);
    (EventSender { tx }, rx)
}

/// Non-blocking sender handed to input workers; a full queue drops the event
/// rather than stalling the producer.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<AppEvent>,
}

impl EventSender {
    pub fn send(&self, event: AppEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_flow_and_overflow_drops() {
        let (tx, rx) = event_channel();
        assert!(tx.send(AppEvent::NextPage));
        assert_eq!(rx.try_recv().unwrap(), AppEvent::NextPage);

        for _ in 0..EVENT_QUEUE_DEPTH {
            assert!(tx.send(AppEvent::BrightnessUp));
        }
        assert!(!tx.send(AppEvent::BrightnessUp), "full queue drops");
    }
}
