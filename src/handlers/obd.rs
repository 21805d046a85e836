//! OBD-II handler: round-robin PID polling over the diagnostic gateway.
//!
//! High-frequency channels (speed, RPM, manifold pressure) are queried every
//! cycle and smoothed through a bounded window; the remaining PIDs rotate one
//! per cycle. A PID answered with five consecutive negative responses is
//! disabled for the session.

use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::{FuelSmoothing, ObdConfig};
use crate::runtime::{HandlerError, Publisher, Worker};
use crate::utils::filter::{SampleWindow, WindowKind};

/// Reply to one PID query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObdResponse {
    Data(Vec<u8>),
    /// UDS negative response code.
    Negative(u8),
    NoResponse,
}

/// Request/response transport (ISO-TP single frames behind the gateway).
pub trait ObdTransport: Send {
    fn query(&mut self, mode: u8, pid: u16) -> Result<ObdResponse, HandlerError>;
}

const OBD_BROADCAST_ID: u32 = 0x7DF;
const OBD_RESPONSE_BASE: u32 = 0x7E8;
const UDS_NEGATIVE: u8 = 0x7F;

/// Single-frame OBD over a CAN channel: broadcast request on 0x7DF, ECU
/// replies on 0x7E8..0x7EF.
pub struct ObdCanLink {
    bus: Box<dyn crate::hw::CanBus>,
    response_timeout: Duration,
}

impl ObdCanLink {
    pub fn new(bus: Box<dyn crate::hw::CanBus>, response_timeout: Duration) -> Self {
        Self { bus, response_timeout }
    }
}

impl ObdTransport for ObdCanLink {
    fn query(&mut self, mode: u8, pid: u16) -> Result<ObdResponse, HandlerError> {
        use crate::hw::CanFrame;
        let request = if mode == 0x22 {
            CanFrame::new(
                OBD_BROADCAST_ID,
                &[0x03, mode, (pid >> 8) as u8, pid as u8, 0, 0, 0, 0],
            )
        } else {
            CanFrame::new(OBD_BROADCAST_ID, &[0x02, mode, pid as u8, 0, 0, 0, 0, 0])
        };
        self.bus.send(&request)?;

        let deadline = Instant::now() + self.response_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(ObdResponse::NoResponse);
            }
            let Some(frame) = self.bus.recv(deadline - now)? else {
                return Ok(ObdResponse::NoResponse);
            };
            if !(OBD_RESPONSE_BASE..OBD_RESPONSE_BASE + 8).contains(&frame.id) {
                continue; // unrelated traffic on a shared bus
            }
            let d = frame.data();
            if d.len() < 3 {
                continue;
            }
            // d[0] = payload length, then service bytes.
            if d[1] == UDS_NEGATIVE {
                return Ok(ObdResponse::Negative(*d.get(3).unwrap_or(&0)));
            }
            if d[1] != (mode | 0x40) {
                continue;
            }
            let payload = if mode == 0x22 {
                if d.len() < 4 || u16::from_be_bytes([d[2], d[3]]) != pid {
                    continue;
                }
                &d[4..]
            } else {
                if d[2] as u16 != pid {
                    continue;
                }
                &d[3..]
            };
            let usable = (d[0] as usize).saturating_sub(if mode == 0x22 { 3 } else { 2 });
            return Ok(ObdResponse::Data(payload[..usable.min(payload.len())].to_vec()));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObdChannel {
    Speed,
    Rpm,
    Throttle,
    CoolantTemp,
    ManifoldPressure,
    FuelLevel,
    IntakeTemp,
    Gear,
}

struct PidSpec {
    channel: ObdChannel,
    mode: u8,
    pid: u16,
    high_freq: bool,
    decode: fn(&[u8]) -> Option<f64>,
}

fn dec_speed(d: &[u8]) -> Option<f64> {
    Some(*d.first()? as f64)
}

fn dec_rpm(d: &[u8]) -> Option<f64> {
    if d.len() < 2 {
        return None;
    }
    Some((256.0 * d[0] as f64 + d[1] as f64) / 4.0)
}

fn dec_percent(d: &[u8]) -> Option<f64> {
    Some(*d.first()? as f64 * 100.0 / 255.0)
}

fn dec_temp_offset(d: &[u8]) -> Option<f64> {
    Some(*d.first()? as f64 - 40.0)
}

fn dec_kpa(d: &[u8]) -> Option<f64> {
    Some(*d.first()? as f64)
}

fn dec_gear(d: &[u8]) -> Option<f64> {
    Some(*d.first()? as f64)
}

/// Standard Mode 01 table plus the vendor Mode 22 gear PID.
const PID_TABLE: &[PidSpec] = &[
    PidSpec { channel: ObdChannel::Speed, mode: 0x01, pid: 0x0D, high_freq: true, decode: dec_speed },
    PidSpec { channel: ObdChannel::Rpm, mode: 0x01, pid: 0x0C, high_freq: true, decode: dec_rpm },
    PidSpec { channel: ObdChannel::ManifoldPressure, mode: 0x01, pid: 0x0B, high_freq: true, decode: dec_kpa },
    PidSpec { channel: ObdChannel::Throttle, mode: 0x01, pid: 0x11, high_freq: false, decode: dec_percent },
    PidSpec { channel: ObdChannel::CoolantTemp, mode: 0x01, pid: 0x05, high_freq: false, decode: dec_temp_offset },
    PidSpec { channel: ObdChannel::FuelLevel, mode: 0x01, pid: 0x2F, high_freq: false, decode: dec_percent },
    PidSpec { channel: ObdChannel::IntakeTemp, mode: 0x01, pid: 0x0F, high_freq: false, decode: dec_temp_offset },
    PidSpec { channel: ObdChannel::Gear, mode: 0x22, pid: 0xF40C, high_freq: false, decode: dec_gear },
];

/// Vehicle state assembled from the PID table. Unsupported or disabled PIDs
/// read `None` and render as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObdSnapshot {
    pub speed_kmh: Option<f64>,
    pub rpm: Option<f64>,
    pub throttle_pct: Option<f64>,
    pub coolant_c: Option<f64>,
    pub map_kpa: Option<f64>,
    pub fuel_pct: Option<f64>,
    pub intake_c: Option<f64>,
    pub gear: Option<u8>,
}

struct PidState {
    consecutive_failures: u32,
    disabled: bool,
    smoother: Option<SampleWindow>,
}

pub struct ObdWorker {
    transport: Box<dyn ObdTransport>,
    cfg: ObdConfig,
    state: Vec<PidState>,
    low_freq_cursor: usize,
    current: ObdSnapshot,
    last_cycle: Option<Instant>,
}

impl ObdWorker {
    pub fn new(transport: Box<dyn ObdTransport>, cfg: ObdConfig) -> Self {
        let state = PID_TABLE
            .iter()
            .map(|spec| PidState {
                consecutive_failures: 0,
                disabled: false,
                smoother: spec
                    .high_freq
                    .then(|| SampleWindow::new(cfg.smoothing_window)),
            })
            .collect();
        Self {
            transport,
            cfg,
            state,
            low_freq_cursor: 0,
            current: ObdSnapshot::default(),
            last_cycle: None,
        }
    }

    fn apply(&mut self, idx: usize, value: f64) {
        let smoothed = match self.state[idx].smoother.as_mut() {
            Some(w) => {
                w.push(value);
                w.smoothed(match self.cfg.smoothing {
                    FuelSmoothing::Median => WindowKind::Median,
                    FuelSmoothing::Mean => WindowKind::Mean,
                })
                .unwrap_or(value)
            }
            None => value,
        };
        match PID_TABLE[idx].channel {
            ObdChannel::Speed => self.current.speed_kmh = Some(smoothed),
            ObdChannel::Rpm => self.current.rpm = Some(smoothed),
            ObdChannel::Throttle => self.current.throttle_pct = Some(smoothed),
            ObdChannel::CoolantTemp => self.current.coolant_c = Some(smoothed),
            ObdChannel::ManifoldPressure => self.current.map_kpa = Some(smoothed),
            ObdChannel::FuelLevel => self.current.fuel_pct = Some(smoothed),
            ObdChannel::IntakeTemp => self.current.intake_c = Some(smoothed),
            ObdChannel::Gear => self.current.gear = Some(smoothed as u8),
        }
    }

    fn clear_channel(&mut self, idx: usize) {
        match PID_TABLE[idx].channel {
            ObdChannel::Speed => self.current.speed_kmh = None,
            ObdChannel::Rpm => self.current.rpm = None,
            ObdChannel::Throttle => self.current.throttle_pct = None,
            ObdChannel::CoolantTemp => self.current.coolant_c = None,
            ObdChannel::ManifoldPressure => self.current.map_kpa = None,
            ObdChannel::FuelLevel => self.current.fuel_pct = None,
            ObdChannel::IntakeTemp => self.current.intake_c = None,
            ObdChannel::Gear => self.current.gear = None,
        }
    }

    fn query_pid(&mut self, idx: usize) -> Result<(), HandlerError> {
        let spec = &PID_TABLE[idx];
        let outcome = self.transport.query(spec.mode, spec.pid)?;
        match outcome {
            ObdResponse::Data(bytes) => {
                self.state[idx].consecutive_failures = 0;
                match (spec.decode)(&bytes) {
                    Some(v) => self.apply(idx, v),
                    None => debug!("PID {:02x}:{:04x} short payload", spec.mode, spec.pid),
                }
            }
            ObdResponse::Negative(nrc) => {
                self.note_failure(idx, &format!("NRC 0x{nrc:02x}"));
            }
            ObdResponse::NoResponse => {
                self.note_failure(idx, "no response");
            }
        }
        Ok(())
    }

    fn note_failure(&mut self, idx: usize, why: &str) {
        let st = &mut self.state[idx];
        st.consecutive_failures += 1;
        if st.consecutive_failures >= self.cfg.pid_disable_after && !st.disabled {
            st.disabled = true;
            let spec = &PID_TABLE[idx];
            info!(
                "disabling unsupported PID {:02x}:{:04x} after {} failures ({why})",
                spec.mode, spec.pid, st.consecutive_failures
            );
            self.clear_channel(idx);
        }
    }

    pub fn disabled_pids(&self) -> Vec<ObdChannel> {
        PID_TABLE
            .iter()
            .zip(&self.state)
            .filter(|(_, st)| st.disabled)
            .map(|(spec, _)| spec.channel)
            .collect()
    }
}

impl Worker for ObdWorker {
    type Payload = ObdSnapshot;

    fn poll(&mut self, out: &Publisher<ObdSnapshot>) -> Result<(), HandlerError> {
        // Pace the bus: one cycle per poll interval.
        if let Some(last) = self.last_cycle {
            let elapsed = last.elapsed();
            if elapsed < self.cfg.poll_interval {
                std::thread::sleep(self.cfg.poll_interval - elapsed);
            }
        }
        self.last_cycle = Some(Instant::now());

        for idx in 0..PID_TABLE.len() {
            if PID_TABLE[idx].high_freq && !self.state[idx].disabled {
                self.query_pid(idx)?;
            }
        }

        // One low-frequency PID per cycle, skipping disabled entries.
        let low: Vec<usize> = (0..PID_TABLE.len())
            .filter(|&i| !PID_TABLE[i].high_freq && !self.state[i].disabled)
            .collect();
        if !low.is_empty() {
            let idx = low[self.low_freq_cursor % low.len()];
            self.low_freq_cursor = self.low_freq_cursor.wrapping_add(1);
            self.query_pid(idx)?;
        }

        out.publish(self.current.clone());
        Ok(())
    }

    fn backoff(&self) -> crate::runtime::ExponentialBackoff {
        crate::runtime::ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(64))
    }
}
