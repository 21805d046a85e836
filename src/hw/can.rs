//! Raw SocketCAN transport.
//!
//! The appliance talks to its corner sensors, radar units and the OBD-II
//! gateway over classic CAN 2.0 frames. Frame payloads are decoded by the
//! owning handler; this layer only moves 16-byte raw frames.

use std::io;
use std::time::Duration;

use crate::runtime::HandlerError;

/// Classic CAN frame: 11/29-bit identifier plus up to 8 data bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    len: u8,
    bytes: [u8; 8],
}

impl CanFrame {
    pub fn new(id: u32, data: &[u8]) -> Self {
        let len = data.len().min(8);
        let mut bytes = [0u8; 8];
        bytes[..len].copy_from_slice(&data[..len]);
        Self { id, len: len as u8, bytes }
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One CAN channel. Exactly one handler owns each instance; the socket is
/// closed on drop.
pub trait CanBus: Send {
    /// Receives one frame, returning `None` when nothing arrived in `timeout`.
    fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>, HandlerError>;

    fn send(&mut self, frame: &CanFrame) -> Result<(), HandlerError>;
}

// Kernel ABI structs, laid out to match <linux/can.h>.

#[repr(C)]
struct RawCanAddr {
    can_family: libc::sa_family_t,
    can_ifindex: libc::c_int,
    // covers the tp/j1939 address union
    addr: [u32; 4],
}

#[repr(C)]
struct RawCanFrame {
    can_id: u32,
    can_dlc: u8,
    pad: u8,
    res0: u8,
    res1: u8,
    data: [u8; 8],
}

/// Raw AF_CAN socket bound to one interface (e.g. `can_b2_0`).
pub struct SocketCan {
    fd: libc::c_int,
    read_timeout: Duration,
}

impl SocketCan {
    pub fn open(interface: &str) -> Result<Self, HandlerError> {
        let fd = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_RAW, libc::CAN_RAW) };
        if fd < 0 {
            return Err(HandlerError::Init(format!(
                "socket({interface}): {}",
                io::Error::last_os_error()
            )));
        }

        let mut name = [0u8; libc::IF_NAMESIZE];
        if interface.len() >= name.len() {
            unsafe { libc::close(fd) };
            return Err(HandlerError::Init(format!("interface name too long: {interface}")));
        }
        name[..interface.len()].copy_from_slice(interface.as_bytes());
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr() as *const libc::c_char) };
        if ifindex == 0 {
            unsafe { libc::close(fd) };
            return Err(HandlerError::Init(format!(
                "no such CAN interface: {interface}: {}",
                io::Error::last_os_error()
            )));
        }

        let addr = RawCanAddr {
            can_family: libc::AF_CAN as libc::sa_family_t,
            can_ifindex: ifindex as libc::c_int,
            addr: [0; 4],
        };
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const RawCanAddr as *const libc::sockaddr,
                std::mem::size_of::<RawCanAddr>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            unsafe { libc::close(fd) };
            return Err(HandlerError::Init(format!(
                "bind({interface}): {}",
                io::Error::last_os_error()
            )));
        }

        let mut bus = Self { fd, read_timeout: Duration::ZERO };
        bus.set_read_timeout(Duration::from_millis(100))?;
        Ok(bus)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), HandlerError> {
        if timeout == self.read_timeout {
            return Ok(());
        }
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(HandlerError::Device(format!(
                "SO_RCVTIMEO: {}",
                io::Error::last_os_error()
            )));
        }
        self.read_timeout = timeout;
        Ok(())
    }
}

impl CanBus for SocketCan {
    fn recv(&mut self, timeout: Duration) -> Result<Option<CanFrame>, HandlerError> {
        self.set_read_timeout(timeout)?;
        let mut raw = RawCanFrame {
            can_id: 0,
            can_dlc: 0,
            pad: 0,
            res0: 0,
            res1: 0,
            data: [0; 8],
        };
        let n = unsafe {
            libc::read(
                self.fd,
                &mut raw as *mut RawCanFrame as *mut libc::c_void,
                std::mem::size_of::<RawCanFrame>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Ok(None),
                io::ErrorKind::Interrupted => Ok(None),
                _ => Err(HandlerError::Io(err)),
            };
        }
        if (n as usize) < std::mem::size_of::<RawCanFrame>() {
            return Err(HandlerError::Protocol(format!("short CAN read: {n} bytes")));
        }
        Ok(Some(CanFrame::new(
            raw.can_id,
            &raw.data[..raw.can_dlc.min(8) as usize],
        )))
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), HandlerError> {
        let mut raw = RawCanFrame {
            can_id: frame.id,
            can_dlc: frame.len() as u8,
            pad: 0,
            res0: 0,
            res1: 0,
            data: [0; 8],
        };
        raw.data[..frame.len()].copy_from_slice(frame.data());
        let n = unsafe {
            libc::write(
                self.fd,
                &raw as *const RawCanFrame as *const libc::c_void,
                std::mem::size_of::<RawCanFrame>(),
            )
        };
        if n < 0 {
            return Err(HandlerError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for SocketCan {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_truncates_to_eight_bytes() {
        let f = CanFrame::new(0x123, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(f.len(), 8);
        assert_eq!(f.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn short_frame_keeps_length() {
        let f = CanFrame::new(0x7DF, &[0x02, 0x01, 0x0D]);
        assert_eq!(f.len(), 3);
        assert_eq!(f.data(), &[0x02, 0x01, 0x0D]);
    }

    #[test]
    fn raw_frame_layout_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<RawCanFrame>(), 16);
    }
}
