//! Serial NMEA source for the GPS receiver.

use std::io::Read;
use std::time::Duration;

use crate::runtime::HandlerError;

/// Line-oriented NMEA sentence source.
pub trait NmeaSource: Send {
    /// Returns the next complete sentence (without CR/LF), or `None` when no
    /// full line arrived within the port's read timeout.
    fn read_sentence(&mut self) -> Result<Option<String>, HandlerError>;
}

/// NMEA reader over a hardware serial port.
pub struct SerialNmea {
    port: Box<dyn serialport::SerialPort>,
    buf: Vec<u8>,
}

impl SerialNmea {
    pub fn open(path: &str, baud: u32, timeout: Duration) -> Result<Self, HandlerError> {
        let port = serialport::new(path, baud)
            .timeout(timeout)
            .open()
            .map_err(|e| HandlerError::Init(format!("open {path}: {e}")))?;
        Ok(Self { port, buf: Vec::with_capacity(256) })
    }
}

impl NmeaSource for SerialNmea {
    fn read_sentence(&mut self) -> Result<Option<String>, HandlerError> {
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => return Err(HandlerError::Disconnected),
                Ok(_) => {
                    match byte[0] {
                        b'\n' => {
                            let line = String::from_utf8_lossy(&self.buf).trim().to_string();
                            self.buf.clear();
                            if !line.is_empty() {
                                return Ok(Some(line));
                            }
                        }
                        b'\r' => {}
                        c => {
                            // Cap runaway garbage between newlines.
                            if self.buf.len() < 512 {
                                self.buf.push(c);
                            } else {
                                self.buf.clear();
                            }
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(None),
                Err(e) => return Err(HandlerError::Io(e)),
            }
        }
    }
}
