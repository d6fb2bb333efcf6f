/* Generic-HID transport backend: `/dev/hidraw*` report I/O plus the
 * descriptor-fetch ioctl, using the same `HIDIOCGFEATURE`/`HIDIOCSFEATURE`
 * request-number construction as feature-report access. */
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use nix::libc;
use tracing::debug;

use super::{Result, Transport, TransportError};

/* Linux hidraw.h: `struct hidraw_report_descriptor { __u32 size; __u8
 * value[HID_MAX_DESCRIPTOR_SIZE]; }`, and `HIDIOCGRDESCSIZE`/
 * `HIDIOCGRDESC` to fetch it. */
const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

#[repr(C)]
struct HidrawReportDescriptor {
    size: u32,
    value: [u8; HID_MAX_DESCRIPTOR_SIZE],
}

fn hidiocgrdescsize_req() -> libc::c_ulong {
    /* `_IOR('H', 0x01, int)` */
    let ioc_read: libc::c_ulong = 2;
    (ioc_read << 30) | (b'H' as libc::c_ulong) << 8 | 0x01 | (4u64 << 16)
}

fn hidiocgrdesc_req() -> libc::c_ulong {
    /* `_IOR('H', 0x02, struct hidraw_report_descriptor)` */
    let ioc_read: libc::c_ulong = 2;
    let len = std::mem::size_of::<HidrawReportDescriptor>() as libc::c_ulong;
    (ioc_read << 30) | (b'H' as libc::c_ulong) << 8 | 0x02 | (len << 16)
}

/* `HIDIOCGFEATURE(len)`: `_IOC(_IOC_READ|_IOC_WRITE, 'H', 0x07, len)`. */
fn hid_get_feature_req(len: usize) -> libc::c_ulong {
    let ioc_readwrite: libc::c_ulong = 3;
    (ioc_readwrite << 30) | (b'H' as libc::c_ulong) << 8 | 0x07 | ((len as libc::c_ulong) << 16)
}

pub struct HidTransport {
    file: std::fs::File,
}

impl HidTransport {
    pub fn open(path: &str) -> Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

impl Transport for HidTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let n = std::io::Write::write(&mut self.file, bytes)?;
        debug!("hid TX {} bytes: {:02x?}", n, bytes);
        Ok(n)
    }

    fn read(
        &mut self,
        buf: &mut [u8],
        _initial_timeout: Duration,
        _subsequent_timeout: Duration,
    ) -> Result<usize> {
        /* hidraw reads deliver one whole report per call; there is no
         * meaningful byte-at-a-time timeout to apply. */
        let n = std::io::Read::read(&mut self.file, buf)?;
        debug!("hid RX {} bytes: {:02x?}", n, &buf[..n]);
        Ok(n)
    }

    fn set_hid_report(&mut self, report: &[u8]) -> Result<()> {
        std::io::Write::write_all(&mut self.file, report)?;
        Ok(())
    }

    fn get_hid_report(&mut self, report_id: u8, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Err(TransportError::Unsupported);
        }
        out[0] = report_id;
        let fd = self.file.as_raw_fd();
        let req = hid_get_feature_req(out.len());
        /* SAFETY: `fd` is a valid open hidraw file descriptor; `out` is a
         * live mutable slice and its length is encoded into `req`. */
        let res = unsafe { libc::ioctl(fd, req, out.as_mut_ptr()) };
        if res < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        Ok(res as usize)
    }

    fn get_hid_descriptor(&mut self) -> Result<Vec<u8>> {
        let fd = self.file.as_raw_fd();
        let mut size: libc::c_int = 0;

        /* SAFETY: `fd` is a valid open hidraw fd; `size` is a live `int`
         * for the duration of the call. */
        let res = unsafe { libc::ioctl(fd, hidiocgrdescsize_req(), &mut size as *mut libc::c_int) };
        if res < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }

        let mut desc = HidrawReportDescriptor {
            size: size as u32,
            value: [0u8; HID_MAX_DESCRIPTOR_SIZE],
        };

        /* SAFETY: `fd` is a valid open hidraw fd; `desc` is a live,
         * correctly-sized `hidraw_report_descriptor` for the duration of
         * the call, with `size` already populated as the kernel requires. */
        let res = unsafe {
            libc::ioctl(
                fd,
                hidiocgrdesc_req(),
                &mut desc as *mut HidrawReportDescriptor,
            )
        };
        if res < 0 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }

        Ok(desc.value[..desc.size as usize].to_vec())
    }
}
