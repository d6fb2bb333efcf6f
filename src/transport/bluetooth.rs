/* Bluetooth RFCOMM transport backend (Linux/BlueZ only).
 *
 * The kernel's Bluetooth socket family has no safe wrapper in `nix`, so
 * this talks to `AF_BLUETOOTH`/`BTPROTO_RFCOMM` sockets directly through
 * `libc`, reaching for raw `ioctl` when no safe wrapper exists. */
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::time::Duration;

use nix::libc;
use tracing::debug;

use super::{Result, Transport, TransportError};

const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_RFCOMM: libc::c_int = 3;

/* Matches the kernel's `struct sockaddr_rc` from `bluetooth/rfcomm.h`. */
#[repr(C)]
struct SockaddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: [u8; 6],
    rc_channel: u8,
}

fn parse_bdaddr(address: &str) -> Result<[u8; 6]> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = address.split(':').collect();
    if parts.len() != 6 {
        return Err(TransportError::Io(std::io::Error::other(format!(
            "invalid Bluetooth address {address:?}"
        ))));
    }
    /* The kernel stores the address little-endian (last octet first). */
    for (i, part) in parts.iter().rev().enumerate() {
        out[i] = u8::from_str_radix(part, 16)
            .map_err(|_| TransportError::Io(std::io::Error::other("invalid address octet")))?;
    }
    Ok(out)
}

pub struct BluetoothTransport {
    fd: OwnedFd,
}

impl BluetoothTransport {
    pub fn open(address: &str, rfcomm_channel: u8) -> Result<Self> {
        let bdaddr = parse_bdaddr(address)?;

        /* SAFETY: `socket(2)` with a constant, valid domain/type/protocol
         * triple; the result is checked before use. */
        let raw = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_STREAM, BTPROTO_RFCOMM) };
        if raw < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        /* SAFETY: `raw` was just returned by a successful `socket()` call
         * and is not owned anywhere else yet. */
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let addr = SockaddrRc {
            rc_family: AF_BLUETOOTH as libc::sa_family_t,
            rc_bdaddr: bdaddr,
            rc_channel: rfcomm_channel,
        };

        /* SAFETY: `addr` is a live, correctly-sized `sockaddr_rc` for the
         * duration of this call; `fd` is a valid RFCOMM socket. */
        let res = unsafe {
            libc::connect(
                std::os::unix::io::AsRawFd::as_raw_fd(&fd),
                &addr as *const SockaddrRc as *const libc::sockaddr,
                std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
            )
        };
        if res < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }

        Ok(Self { fd })
    }

    fn set_recv_timeout(&self, timeout: Duration) -> Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        /* SAFETY: `tv` is a live, correctly-sized `timeval` for the
         * duration of this call; `fd` is a valid open socket. */
        let res = unsafe {
            libc::setsockopt(
                std::os::unix::io::AsRawFd::as_raw_fd(&self.fd),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if res < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Transport for BluetoothTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        /* SAFETY: `fd` is a valid, connected socket; `bytes` is a live
         * slice for the duration of the call. */
        let n = unsafe {
            libc::write(
                std::os::unix::io::AsRawFd::as_raw_fd(&self.fd),
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
            )
        };
        if n < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        debug!("bluetooth TX {} bytes: {:02x?}", n, bytes);
        Ok(n as usize)
    }

    fn read(
        &mut self,
        buf: &mut [u8],
        initial_timeout: Duration,
        _subsequent_timeout: Duration,
    ) -> Result<usize> {
        self.set_recv_timeout(initial_timeout)?;
        /* SAFETY: `fd` is a valid, connected socket; `buf` is a live
         * mutable slice for the duration of the call. */
        let n = unsafe {
            libc::read(
                std::os::unix::io::AsRawFd::as_raw_fd(&self.fd),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) {
                return Ok(0);
            }
            return Err(TransportError::Io(err));
        }
        debug!("bluetooth RX {} bytes: {:02x?}", n, &buf[..n as usize]);
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colon_separated_address_little_endian() {
        let addr = parse_bdaddr("01:02:03:04:05:06").unwrap();
        assert_eq!(addr, [0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn rejects_malformed_address() {
        assert!(parse_bdaddr("not-an-address").is_err());
    }
}
