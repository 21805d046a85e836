//! Radar handler: passive track RX plus the keep-alive TX the units require.
//!
//! Two fitments are supported. Toyota Denso units listen on their own bus and
//! need a 100 Hz keep-alive (ACC_CONTROL plus nine static frames) on the car
//! channel or they stop transmitting tracks; when two Denso units share one
//! car channel, configuration names exactly one of them keep-alive emitter.
//! Tesla Bosch units use a single bus for both directions and identify the
//! vehicle by reading the VIN over UDS at startup.

use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::RadarConfig;
use crate::hw::{CanBus, CanFrame};
use crate::runtime::{HandlerError, Publisher, Worker};

/// One radar object as published to the renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadarTrack {
    pub id: u32,
    pub range_m: f64,
    pub lateral_m: f64,
    pub rel_speed_mps: f64,
    pub age_s: f32,
}

#[derive(Debug, Clone, Default)]
pub struct RadarSnapshot {
    pub tracks: Vec<RadarTrack>,
}

/// Raw track observation decoded from one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackObs {
    pub id: u32,
    pub range_m: f64,
    pub lateral_m: f64,
    pub rel_speed_mps: f64,
}

/// Vendor-specific frame handling; the bit layouts live behind this seam.
pub trait RadarDecoder: Send {
    fn decode(&self, frame: &CanFrame) -> Option<TrackObs>;

    /// Frames repeated at the keep-alive cadence; empty when the unit needs
    /// none.
    fn keepalive_frames(&self) -> &[CanFrame];

    /// One-time startup exchange on the radar bus.
    fn startup(&mut self, _bus: &mut dyn CanBus) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn obs_from_payload(id: u32, d: &[u8]) -> Option<TrackObs> {
    if d.len() < 7 {
        return None;
    }
    if d[6] & 0x01 == 0 {
        return None; // not a valid object slot
    }
    Some(TrackObs {
        id,
        range_m: u16::from_le_bytes([d[0], d[1]]) as f64 / 100.0,
        lateral_m: i16::from_le_bytes([d[2], d[3]]) as f64 / 100.0,
        rel_speed_mps: i16::from_le_bytes([d[4], d[5]]) as f64 / 100.0,
    })
}

/// Toyota Denso: tracks on 0x210..=0x21F, keep-alive on the car channel.
pub struct DensoDecoder {
    keepalive: Vec<CanFrame>,
}

const DENSO_TRACK_BASE: u32 = 0x210;
const DENSO_TRACK_COUNT: u32 = 16;
const ACC_CONTROL_ID: u32 = 0x343;
/// Static chassis frames the radar expects to observe on the car bus.
const DENSO_STATIC_IDS: [u32; 9] =
    [0x141, 0x160, 0x283, 0x2E6, 0x2E7, 0x33E, 0x365, 0x366, 0x4CB];

impl DensoDecoder {
    pub fn new() -> Self {
        let mut keepalive = Vec::with_capacity(1 + DENSO_STATIC_IDS.len());
        keepalive.push(CanFrame::new(ACC_CONTROL_ID, &[0x00, 0x00, 0x63, 0xC0, 0x00, 0x00, 0x00, 0x00]));
        for id in DENSO_STATIC_IDS {
            keepalive.push(CanFrame::new(id, &[0; 8]));
        }
        Self { keepalive }
    }
}

impl Default for DensoDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RadarDecoder for DensoDecoder {
    fn decode(&self, frame: &CanFrame) -> Option<TrackObs> {
        let idx = frame.id.checked_sub(DENSO_TRACK_BASE)?;
        if idx >= DENSO_TRACK_COUNT {
            return None;
        }
        obs_from_payload(idx, frame.data())
    }

    fn keepalive_frames(&self) -> &[CanFrame] {
        &self.keepalive
    }
}

/// Tesla Bosch: single bus, tracks on 0x310..=0x36F, VIN read at startup.
pub struct TeslaBoschDecoder {
    pub vin: Option<String>,
}

const TESLA_TRACK_BASE: u32 = 0x310;
const TESLA_TRACK_COUNT: u32 = 0x60;
const UDS_VIN_REQUEST_ID: u32 = 0x749;
const UDS_VIN_RESPONSE_ID: u32 = 0x74A;

impl TeslaBoschDecoder {
    pub fn new() -> Self {
        Self { vin: None }
    }
}

impl Default for TeslaBoschDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RadarDecoder for TeslaBoschDecoder {
    fn decode(&self, frame: &CanFrame) -> Option<TrackObs> {
        let idx = frame.id.checked_sub(TESLA_TRACK_BASE)?;
        if idx >= TESLA_TRACK_COUNT {
            return None;
        }
        obs_from_payload(idx, frame.data())
    }

    fn keepalive_frames(&self) -> &[CanFrame] {
        &[]
    }

    fn startup(&mut self, bus: &mut dyn CanBus) -> Result<(), HandlerError> {
        // UDS ReadDataByIdentifier F190 (VIN). A silent bus is tolerated: the
        // radar still tracks, we just cannot label the vehicle.
        bus.send(&CanFrame::new(
            UDS_VIN_REQUEST_ID,
            &[0x03, 0x22, 0xF1, 0x90, 0x00, 0x00, 0x00, 0x00],
        ))?;
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            match bus.recv(Duration::from_millis(100))? {
                Some(frame) if frame.id == UDS_VIN_RESPONSE_ID => {
                    let text: String = frame
                        .data()
                        .iter()
                        .skip(4)
                        .filter(|b| b.is_ascii_alphanumeric())
                        .map(|&b| b as char)
                        .collect();
                    if !text.is_empty() {
                        info!("radar VIN fragment: {text}");
                        self.vin = Some(text);
                    }
                    return Ok(());
                }
                Some(_) => continue,
                None => break,
            }
        }
        debug!("no VIN response from radar");
        Ok(())
    }
}

struct LiveTrack {
    obs: TrackObs,
    last_seen: Instant,
}

pub struct RadarWorker {
    rx: Box<dyn CanBus>,
    /// Separate keep-alive channel (Denso); `None` when TX shares `rx`.
    tx: Option<Box<dyn CanBus>>,
    decoder: Box<dyn RadarDecoder>,
    cfg: RadarConfig,
    tracks: Vec<LiveTrack>,
    last_keepalive: Instant,
}

impl RadarWorker {
    pub fn new(
        rx: Box<dyn CanBus>,
        tx: Option<Box<dyn CanBus>>,
        decoder: Box<dyn RadarDecoder>,
        cfg: RadarConfig,
    ) -> Self {
        Self {
            rx,
            tx,
            decoder,
            cfg,
            tracks: Vec::new(),
            last_keepalive: Instant::now(),
        }
    }

    /// Folds an observation into the live set: an observation landing within
    /// the merge radius of an existing track updates it in place, whatever
    /// the reported id.
    fn upsert(&mut self, obs: TrackObs, now: Instant) {
        let merge_r = self.cfg.merge_radius_m;
        for t in self.tracks.iter_mut() {
            let dr = t.obs.range_m - obs.range_m;
            let dl = t.obs.lateral_m - obs.lateral_m;
            if (dr * dr + dl * dl).sqrt() <= merge_r {
                t.obs = TrackObs { id: t.obs.id, ..obs };
                t.last_seen = now;
                return;
            }
        }
        self.tracks.push(LiveTrack { obs, last_seen: now });
    }

    fn prune(&mut self, now: Instant) {
        let timeout = self.cfg.track_timeout;
        self.tracks.retain(|t| now.duration_since(t.last_seen) <= timeout);
    }

    fn maybe_keepalive(&mut self, now: Instant) -> Result<(), HandlerError> {
        if !self.cfg.keepalive_emitter {
            return Ok(());
        }
        if now.duration_since(self.last_keepalive) < self.cfg.keepalive_interval {
            return Ok(());
        }
        self.last_keepalive = now;
        let frames: Vec<CanFrame> = self.decoder.keepalive_frames().to_vec();
        let bus: &mut dyn CanBus = match self.tx.as_mut() {
            Some(b) => b.as_mut(),
            None => self.rx.as_mut(),
        };
        for f in &frames {
            bus.send(f)?;
        }
        Ok(())
    }

    fn snapshot(&self, now: Instant) -> RadarSnapshot {
        RadarSnapshot {
            tracks: self
                .tracks
                .iter()
                .map(|t| RadarTrack {
                    id: t.obs.id,
                    range_m: t.obs.range_m,
                    lateral_m: t.obs.lateral_m,
                    rel_speed_mps: t.obs.rel_speed_mps,
                    age_s: now.duration_since(t.last_seen).as_secs_f32(),
                })
                .collect(),
        }
    }
}

impl Worker for RadarWorker {
    type Payload = RadarSnapshot;

    fn init(&mut self) -> Result<(), HandlerError> {
        self.decoder.startup(self.rx.as_mut())
    }

    fn poll(&mut self, out: &Publisher<RadarSnapshot>) -> Result<(), HandlerError> {
        let window = self.cfg.keepalive_interval.min(Duration::from_millis(20));
        let frame = self.rx.recv(window)?;
        let now = Instant::now();

        if let Some(frame) = frame {
            if let Some(obs) = self.decoder.decode(&frame) {
                self.upsert(obs, now);
            }
        }
        self.prune(now);
        self.maybe_keepalive(now)?;
        out.publish(self.snapshot(now));
        Ok(())
    }
}
