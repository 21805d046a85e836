//! IMU handler: ~100 Hz accelerometer/gyro poll over the shared I²C bus.
//!
//! Zero-offset calibration lives inside the handler: the first second of
//! samples taken at rest becomes the bias, with gravity left on the Z axis.

use std::time::{Duration, Instant};

use crate::config::ImuConfig;
use crate::hw::SharedI2cBus;
use crate::runtime::{HandlerError, Publisher, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ImuSample {
    pub accel_g: [f64; 3],
    pub gyro_dps: [f64; 3],
}

/// Raw 16-bit sensor readout.
pub trait ImuDevice: Send {
    fn read_sample(&mut self) -> Result<ImuSample, HandlerError>;
}

/// MPU-6050-style register map over the shared bus.
pub struct Mpu6050 {
    bus: SharedI2cBus,
    address: u8,
}

const REG_PWR_MGMT_1: u8 = 0x6B;
const REG_ACCEL_XOUT_H: u8 = 0x3B;
const ACCEL_LSB_PER_G: f64 = 16_384.0;
const GYRO_LSB_PER_DPS: f64 = 131.0;

impl Mpu6050 {
    pub fn new(bus: SharedI2cBus, address: u8) -> Result<Self, HandlerError> {
        // Wake from sleep; default clock source.
        bus.transaction(|b| b.write(address, &[REG_PWR_MGMT_1, 0x00]))?;
        Ok(Self { bus, address })
    }
}

impl ImuDevice for Mpu6050 {
    fn read_sample(&mut self) -> Result<ImuSample, HandlerError> {
        let mut buf = [0u8; 14];
        let addr = self.address;
        self.bus
            .transaction(|b| b.write_read(addr, &[REG_ACCEL_XOUT_H], &mut buf))?;

        let word = |i: usize| i16::from_be_bytes([buf[i], buf[i + 1]]) as f64;
        Ok(ImuSample {
            accel_g: [
                word(0) / ACCEL_LSB_PER_G,
                word(2) / ACCEL_LSB_PER_G,
                word(4) / ACCEL_LSB_PER_G,
            ],
            // buf[6..8] is the die temperature; unused here.
            gyro_dps: [
                word(8) / GYRO_LSB_PER_DPS,
                word(10) / GYRO_LSB_PER_DPS,
                word(12) / GYRO_LSB_PER_DPS,
            ],
        })
    }
}

const CALIBRATION_SAMPLES: u32 = 100;

#[derive(Debug, Clone, Copy, Default)]
struct Calibration {
    accel_bias: [f64; 3],
    gyro_bias: [f64; 3],
    samples: u32,
    done: bool,
}

impl Calibration {
    fn feed(&mut self, s: &ImuSample) {
        if self.done {
            return;
        }
        for i in 0..3 {
            self.accel_bias[i] += s.accel_g[i];
            self.gyro_bias[i] += s.gyro_dps[i];
        }
        self.samples += 1;
        if self.samples >= CALIBRATION_SAMPLES {
            let n = self.samples as f64;
            for i in 0..3 {
                self.accel_bias[i] /= n;
                self.gyro_bias[i] /= n;
            }
            // Keep gravity: bias only the horizontal plane.
            self.accel_bias[2] -= 1.0;
            self.done = true;
        }
    }

    fn apply(&self, s: &ImuSample) -> ImuSample {
        if !self.done {
            return *s;
        }
        let mut out = ImuSample::default();
        for i in 0..3 {
            out.accel_g[i] = s.accel_g[i] - self.accel_bias[i];
            out.gyro_dps[i] = s.gyro_dps[i] - self.gyro_bias[i];
        }
        out
    }
}

/// Commands sent from the UI to the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImuCommand {
    Recalibrate,
}

pub struct ImuWorker {
    device: Box<dyn ImuDevice>,
    cfg: ImuConfig,
    cal: Calibration,
    last_poll: Option<Instant>,
    commands: Option<crossbeam::channel::Receiver<ImuCommand>>,
}

impl ImuWorker {
    pub fn new(device: Box<dyn ImuDevice>, cfg: ImuConfig) -> Self {
        Self { device, cfg, cal: Calibration::default(), last_poll: None, commands: None }
    }

    pub fn with_commands(
        mut self,
        rx: crossbeam::channel::Receiver<ImuCommand>,
    ) -> Self {
        self.commands = Some(rx);
        self
    }

    /// Restarts zero-offset calibration (car at rest, level).
    pub fn recalibrate(&mut self) {
        self.cal = Calibration::default();
    }
}

impl Worker for ImuWorker {
    type Payload = ImuSample;

    fn poll(&mut self, out: &Publisher<ImuSample>) -> Result<(), HandlerError> {
        if let Some(rx) = &self.commands {
            while let Ok(cmd) = rx.try_recv() {
                match cmd {
                    ImuCommand::Recalibrate => self.cal = Calibration::default(),
                }
            }
        }
        if let Some(last) = self.last_poll {
            let elapsed = last.elapsed();
            if elapsed < self.cfg.poll_interval {
                std::thread::sleep(self.cfg.poll_interval - elapsed);
            }
        }
        self.last_poll = Some(Instant::now());

        let raw = self.device.read_sample()?;
        self.cal.feed(&raw);
        out.publish(self.cal.apply(&raw));
        Ok(())
    }

    fn backoff(&self) -> crate::runtime::ExponentialBackoff {
        crate::runtime::ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SnapshotSlot;
    use std::sync::Arc;

    struct BiasedDevice {
        bias: ImuSample,
    }

    impl ImuDevice for BiasedDevice {
        fn read_sample(&mut self) -> Result<ImuSample, HandlerError> {
            // Car at rest: gravity on Z plus mounting bias.
            Ok(ImuSample {
                accel_g: [
                    0.03 + self.bias.accel_g[0],
                    -0.02 + self.bias.accel_g[1],
                    1.01 + self.bias.accel_g[2],
                ],
                gyro_dps: [
                    0.7 + self.bias.gyro_dps[0],
                    -0.4 + self.bias.gyro_dps[1],
                    0.1 + self.bias.gyro_dps[2],
                ],
            })
        }
    }

    fn cfg() -> ImuConfig {
        ImuConfig {
            i2c_path: "/dev/null".into(),
            address: 0x68,
            poll_interval: Duration::ZERO,
        }
    }

    #[test]
    fn calibration_zeroes_rest_bias_but_keeps_gravity() {
        let mut w = ImuWorker::new(Box::new(BiasedDevice { bias: ImuSample::default() }), cfg());
        let slot = Arc::new(SnapshotSlot::new());
        let out = crate::runtime::test_publisher(Arc::clone(&slot));
        for _ in 0..CALIBRATION_SAMPLES + 10 {
            w.poll(&out).unwrap();
        }
        let s = slot.latest().unwrap().payload;
        assert!(s.accel_g[0].abs() < 1e-9);
        assert!(s.accel_g[1].abs() < 1e-9);
        assert!((s.accel_g[2] - 1.0).abs() < 1e-9, "gravity preserved: {}", s.accel_g[2]);
        assert!(s.gyro_dps.iter().all(|g| g.abs() < 1e-9));
    }

    #[test]
    fn pre_calibration_samples_pass_through() {
        let mut w = ImuWorker::new(Box::new(BiasedDevice { bias: ImuSample::default() }), cfg());
        let slot = Arc::new(SnapshotSlot::new());
        let out = crate::runtime::test_publisher(Arc::clone(&slot));
        w.poll(&out).unwrap();
        let s = slot.latest().unwrap().payload;
        assert!((s.accel_g[0] - 0.03).abs() < 1e-9);
    }

    #[test]
    fn recalibrate_restarts_bias_capture() {
        let mut w = ImuWorker::new(Box::new(BiasedDevice { bias: ImuSample::default() }), cfg());
        let slot = Arc::new(SnapshotSlot::new());
        let out = crate::runtime::test_publisher(Arc::clone(&slot));
        for _ in 0..CALIBRATION_SAMPLES {
            w.poll(&out).unwrap();
        }
        assert!(w.cal.done);
        w.recalibrate();
        assert!(!w.cal.done);
    }
}
