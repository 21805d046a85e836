//! I²C bus access serialised across handlers.
//!
//! The appliance shares one physical bus between the IMU and the input
//! devices, so transactions go through a per-bus lock with a bounded
//! acquisition timeout: a stuck peripheral degrades its own handler instead
//! of wedging every bus user.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::runtime::HandlerError;

const I2C_SLAVE: libc::c_ulong = 0x0703;

/// Raw I²C transactions against one peripheral address.
pub trait I2cBus: Send {
    fn write(&mut self, addr: u8, bytes: &[u8]) -> Result<(), HandlerError>;

    /// Write `wbuf` (typically a register address) then read into `rbuf`.
    fn write_read(&mut self, addr: u8, wbuf: &[u8], rbuf: &mut [u8]) -> Result<(), HandlerError>;
}

/// `/dev/i2c-N` adapter.
pub struct LinuxI2c {
    dev: File,
    current_addr: Option<u8>,
}

impl LinuxI2c {
    pub fn open(path: &str) -> Result<Self, HandlerError> {
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| HandlerError::Init(format!("open {path}: {e}")))?;
        Ok(Self { dev, current_addr: None })
    }

    fn select(&mut self, addr: u8) -> Result<(), HandlerError> {
        if self.current_addr == Some(addr) {
            return Ok(());
        }
        let rc = unsafe { libc::ioctl(self.dev.as_raw_fd(), I2C_SLAVE, addr as libc::c_ulong) };
        if rc < 0 {
            return Err(HandlerError::Device(format!(
                "I2C_SLAVE 0x{addr:02x}: {}",
                io::Error::last_os_error()
            )));
        }
        self.current_addr = Some(addr);
        Ok(())
    }
}

impl I2cBus for LinuxI2c {
    fn write(&mut self, addr: u8, bytes: &[u8]) -> Result<(), HandlerError> {
        self.select(addr)?;
        self.dev.write_all(bytes)?;
        Ok(())
    }

    fn write_read(&mut self, addr: u8, wbuf: &[u8], rbuf: &mut [u8]) -> Result<(), HandlerError> {
        self.select(addr)?;
        self.dev.write_all(wbuf)?;
        self.dev.read_exact(rbuf)?;
        Ok(())
    }
}

/// Cloneable handle to a shared bus; each transaction takes the bus lock with
/// a bounded timeout.
#[derive(Clone)]
pub struct SharedI2cBus {
    inner: Arc<Mutex<Box<dyn I2cBus>>>,
    acquire_timeout: Duration,
}

impl SharedI2cBus {
    pub fn new(bus: Box<dyn I2cBus>, acquire_timeout: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(bus)), acquire_timeout }
    }

    pub fn transaction<R>(
        &self,
        f: impl FnOnce(&mut dyn I2cBus) -> Result<R, HandlerError>,
    ) -> Result<R, HandlerError> {
        let mut guard = self
            .inner
            .try_lock_for(self.acquire_timeout)
            .ok_or(HandlerError::BusTimeout)?;
        f(guard.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoBus {
        last_write: Vec<u8>,
    }

    impl I2cBus for EchoBus {
        fn write(&mut self, _addr: u8, bytes: &[u8]) -> Result<(), HandlerError> {
            self.last_write = bytes.to_vec();
            Ok(())
        }

        fn write_read(
            &mut self,
            _addr: u8,
            wbuf: &[u8],
            rbuf: &mut [u8],
        ) -> Result<(), HandlerError> {
            for (i, b) in rbuf.iter_mut().enumerate() {
                *b = wbuf.first().copied().unwrap_or(0).wrapping_add(i as u8);
            }
            Ok(())
        }
    }

    struct StuckBus;

    impl I2cBus for StuckBus {
        fn write(&mut self, _addr: u8, _bytes: &[u8]) -> Result<(), HandlerError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        }

        fn write_read(
            &mut self,
            _addr: u8,
            _wbuf: &[u8],
            _rbuf: &mut [u8],
        ) -> Result<(), HandlerError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        }
    }

    #[test]
    fn shared_bus_serialises_transactions() {
        let bus = SharedI2cBus::new(Box::new(EchoBus { last_write: vec![] }), Duration::from_millis(50));
        let mut out = [0u8; 3];
        bus.transaction(|b| b.write_read(0x68, &[0x10], &mut out)).unwrap();
        assert_eq!(out, [0x10, 0x11, 0x12]);
    }

    #[test]
    fn contended_bus_times_out_instead_of_wedging() {
        let bus = SharedI2cBus::new(Box::new(StuckBus), Duration::from_millis(20));
        let other = bus.clone();
        let holder = std::thread::spawn(move || {
            other.transaction(|b| b.write(0x68, &[0])).unwrap();
        });
        std::thread::sleep(Duration::from_millis(20));
        let res = bus.transaction(|b| b.write(0x68, &[1]));
        assert!(matches!(res, Err(HandlerError::BusTimeout)));
        holder.join().unwrap();
    }
}
