//! TPMS handler: event-driven reports from the radio receiver.
//!
//! The receiver pushes a report whenever a wheel sensor transmits (typically
//! every few seconds, more often under pressure change). A missing sensor is
//! simply an absent entry; pressure and temperature alarms are derived by the
//! renderer from the configured thresholds.

use std::collections::HashMap;
use std::time::Instant;

use crate::runtime::{HandlerError, Publisher, Worker};

use super::WheelCorner;

/// One over-the-air report from a wheel sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TpmsReport {
    pub corner: WheelCorner,
    pub pressure_kpa: f64,
    pub temp_c: f64,
    pub battery_pct: u8,
}

/// Radio receiver delivering decoded reports.
pub trait TpmsReceiver: Send {
    /// Blocks up to the receiver's internal timeout; `None` when quiet.
    fn recv(&mut self) -> Result<Option<TpmsReport>, HandlerError>;
}

/// USB receiver stick framing: `55 <corner> <kPa*10 LE u16> <temp+40> <batt> <xor>`.
pub const TPMS_FRAME_LEN: usize = 7;
const TPMS_FRAME_SYNC: u8 = 0x55;

/// Decodes one receiver frame; `None` for bad sync, checksum or corner id.
pub fn decode_receiver_frame(frame: &[u8]) -> Option<TpmsReport> {
    if frame.len() != TPMS_FRAME_LEN || frame[0] != TPMS_FRAME_SYNC {
        return None;
    }
    let checksum = frame[..TPMS_FRAME_LEN - 1].iter().fold(0u8, |a, b| a ^ b);
    if checksum != frame[TPMS_FRAME_LEN - 1] {
        return None;
    }
    let corner = match frame[1] {
        0 => WheelCorner::FrontLeft,
        1 => WheelCorner::FrontRight,
        2 => WheelCorner::RearLeft,
        3 => WheelCorner::RearRight,
        _ => return None,
    };
    Some(TpmsReport {
        corner,
        pressure_kpa: u16::from_le_bytes([frame[2], frame[3]]) as f64 / 10.0,
        temp_c: frame[4] as f64 - 40.0,
        battery_pct: frame[5].min(100),
    })
}

/// Receiver stick on a serial port.
pub struct SerialTpmsReceiver {
    port: Box<dyn serialport::SerialPort>,
    buf: Vec<u8>,
}

impl SerialTpmsReceiver {
    pub fn open(path: &str, baud: u32, timeout: std::time::Duration) -> Result<Self, HandlerError> {
        let port = serialport::new(path, baud)
            .timeout(timeout)
            .open()
            .map_err(|e| HandlerError::Init(format!("open {path}: {e}")))?;
        Ok(Self { port, buf: Vec::with_capacity(32) })
    }
}

impl TpmsReceiver for SerialTpmsReceiver {
    fn recv(&mut self) -> Result<Option<TpmsReport>, HandlerError> {
        use std::io::Read;
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => return Err(HandlerError::Disconnected),
                Ok(_) => {
                    if self.buf.is_empty() && byte[0] != TPMS_FRAME_SYNC {
                        continue; // hunt for sync
                    }
                    self.buf.push(byte[0]);
                    if self.buf.len() == TPMS_FRAME_LEN {
                        let report = decode_receiver_frame(&self.buf);
                        self.buf.clear();
                        if report.is_some() {
                            return Ok(report);
                        }
                        // Bad frame: resync on the next 0x55.
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(None),
                Err(e) => return Err(HandlerError::Io(e)),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TpmsReading {
    pub pressure_kpa: f64,
    pub temp_c: f64,
    pub battery_pct: u8,
    pub received_at: Instant,
}

/// Last known reading per corner; corners never heard from are absent.
#[derive(Debug, Clone, Default)]
pub struct TpmsSnapshot {
    pub sensors: HashMap<WheelCorner, TpmsReading>,
}

impl TpmsSnapshot {
    pub fn get(&self, corner: WheelCorner) -> Option<&TpmsReading> {
        self.sensors.get(&corner)
    }
}

pub struct TpmsWorker {
    receiver: Box<dyn TpmsReceiver>,
    state: HashMap<WheelCorner, TpmsReading>,
}

impl TpmsWorker {
    pub fn new(receiver: Box<dyn TpmsReceiver>) -> Self {
        Self { receiver, state: HashMap::new() }
    }
}

impl Worker for TpmsWorker {
    type Payload = TpmsSnapshot;

    fn poll(&mut self, out: &Publisher<TpmsSnapshot>) -> Result<(), HandlerError> {
        let Some(report) = self.receiver.recv()? else {
            return Ok(());
        };
        self.state.insert(
            report.corner,
            TpmsReading {
                pressure_kpa: report.pressure_kpa,
                temp_c: report.temp_c,
                battery_pct: report.battery_pct,
                received_at: Instant::now(),
            },
        );
        out.publish(TpmsSnapshot { sensors: self.state.clone() });
        Ok(())
    }
}
