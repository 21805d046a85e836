//! Corner-sensor CAN handler: tyre surface temps, object detection and brake
//! temperatures from the four wheel-well microcontrollers.
//!
//! Passive RX at ~10 Hz per corner. Temperatures arrive as int16 tenths of a
//! degree. A corner quiet for longer than the stale threshold keeps serving
//! its last value with `stale` set so the renderer can dim it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::CornerCanConfig;
use crate::hw::{CanBus, CanFrame};
use crate::runtime::{HandlerError, Publisher, Worker};

use super::WheelCorner;

/// Tyre frame IDs: FL 0x100, FR 0x110, RL 0x120, RR 0x130.
const TYRE_FRAME_BASE: u32 = 0x100;
/// Brake frame IDs: FL 0x140, FR 0x150, RL 0x160, RR 0x170.
const BRAKE_FRAME_BASE: u32 = 0x140;
const CORNER_ID_STRIDE: u32 = 0x10;
/// Broadcast request for a full frame dump from a corner controller.
pub const FRAME_DATA_REQUEST_ID: u32 = 0x7F3;
/// Configuration write target.
pub const CONFIG_WRITE_ID: u32 = 0x7F1;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CornerData {
    pub left_c: f64,
    pub centre_c: f64,
    pub right_c: f64,
    pub detected: bool,
    pub confidence: f64,
    pub brake_inner_c: f64,
    pub brake_outer_c: f64,
    pub brake_status: u8,
    pub stale: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CornerSnapshot {
    pub corners: HashMap<WheelCorner, CornerData>,
}

fn corner_of_id(id: u32, base: u32) -> Option<WheelCorner> {
    match id.checked_sub(base)? / CORNER_ID_STRIDE {
        0 => Some(WheelCorner::FrontLeft),
        1 => Some(WheelCorner::FrontRight),
        2 => Some(WheelCorner::RearLeft),
        3 => Some(WheelCorner::RearRight),
        _ => None,
    }
}

fn temp_tenths(lo: u8, hi: u8) -> f64 {
    i16::from_le_bytes([lo, hi]) as f64 / 10.0
}

/// Decoded field update from one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
enum FrameUpdate {
    Tyre {
        corner: WheelCorner,
        left_c: f64,
        centre_c: f64,
        right_c: f64,
        detected: bool,
        confidence: f64,
    },
    Brake {
        corner: WheelCorner,
        inner_c: f64,
        outer_c: f64,
        status: u8,
    },
}

fn decode(frame: &CanFrame) -> Option<FrameUpdate> {
    let d = frame.data();
    if let Some(corner) = corner_of_id(frame.id, TYRE_FRAME_BASE) {
        if frame.id < BRAKE_FRAME_BASE {
            if d.len() < 8 {
                return None;
            }
            return Some(FrameUpdate::Tyre {
                corner,
                left_c: temp_tenths(d[0], d[1]),
                centre_c: temp_tenths(d[2], d[3]),
                right_c: temp_tenths(d[4], d[5]),
                detected: d[6] & 0x01 != 0,
                confidence: d[7] as f64 / 255.0,
            });
        }
    }
    if let Some(corner) = corner_of_id(frame.id, BRAKE_FRAME_BASE) {
        if d.len() < 5 {
            return None;
        }
        return Some(FrameUpdate::Brake {
            corner,
            inner_c: temp_tenths(d[0], d[1]),
            outer_c: temp_tenths(d[2], d[3]),
            status: d[4],
        });
    }
    None
}

pub struct CornerWorker {
    bus: Box<dyn CanBus>,
    cfg: CornerCanConfig,
    state: HashMap<WheelCorner, CornerData>,
    last_rx: HashMap<WheelCorner, Instant>,
    short_frames: u64,
}

impl CornerWorker {
    pub fn new(bus: Box<dyn CanBus>, cfg: CornerCanConfig) -> Self {
        Self {
            bus,
            cfg,
            state: HashMap::new(),
            last_rx: HashMap::new(),
            short_frames: 0,
        }
    }

    /// Asks every corner controller to dump its raw frame data.
    pub fn request_frame_data(&mut self) -> Result<(), HandlerError> {
        self.bus.send(&CanFrame::new(FRAME_DATA_REQUEST_ID, &[0x01]))
    }

    /// Writes a configuration payload to the corner controllers.
    pub fn write_config(&mut self, payload: &[u8]) -> Result<(), HandlerError> {
        self.bus.send(&CanFrame::new(CONFIG_WRITE_ID, payload))
    }

    fn refresh_staleness(&mut self, now: Instant) {
        for (corner, data) in self.state.iter_mut() {
            let stale = self
                .last_rx
                .get(corner)
                .map_or(true, |t| now.duration_since(*t) > self.cfg.stale_after);
            data.stale = stale;
        }
    }
}

impl Worker for CornerWorker {
    type Payload = CornerSnapshot;

    fn poll(&mut self, out: &Publisher<CornerSnapshot>) -> Result<(), HandlerError> {
        let frame = self.bus.recv(Duration::from_millis(100))?;
        let now = Instant::now();

        if let Some(frame) = frame {
            match decode(&frame) {
                Some(FrameUpdate::Tyre { corner, left_c, centre_c, right_c, detected, confidence }) => {
                    let entry = self.state.entry(corner).or_default();
                    entry.left_c = left_c;
                    entry.centre_c = centre_c;
                    entry.right_c = right_c;
                    entry.detected = detected;
                    entry.confidence = confidence;
                    self.last_rx.insert(corner, now);
                }
                Some(FrameUpdate::Brake { corner, inner_c, outer_c, status }) => {
                    let entry = self.state.entry(corner).or_default();
                    entry.brake_inner_c = inner_c;
                    entry.brake_outer_c = outer_c;
                    entry.brake_status = status;
                    self.last_rx.insert(corner, now);
                }
                None => {
                    self.short_frames += 1;
                    if self.short_frames % 100 == 1 {
                        log::warn!(
                            "undecodable corner frame id 0x{:x} ({} so far)",
                            frame.id,
                            self.short_frames
                        );
                    }
                    return Ok(());
                }
            }
        }

        if !self.state.is_empty() {
            self.refresh_staleness(now);
            out.publish(CornerSnapshot { corners: self.state.clone() });
        }
        Ok(())
    }
}
