/* Transport abstraction: a capability set with three to four concrete
 * implementations, favoring a shared trait over per-protocol inheritance.
 * Every driver talks to its transport only through this trait; no driver
 * touches `serialport`/`rusb`/`bluer`/ioctl types directly. */
#[cfg(feature = "transport-bluetooth")]
pub mod bluetooth;
#[cfg(feature = "transport-hid")]
pub mod hid;
#[cfg(feature = "transport-serial")]
pub mod serial;
#[cfg(feature = "transport-usb")]
pub mod usb;

pub mod mock;

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for data")]
    Timeout,
    #[error("device disconnected")]
    Disconnected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation not supported by this transport")]
    Unsupported,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/* One alternative way to reach the device; `connect` tries each in turn. */
#[derive(Debug, Clone)]
pub enum TransportDescriptor {
    Serial {
        path: String,
        baud: u32,
    },
    Usb {
        vendor_id: u16,
        product_id: u16,
        configuration: u8,
        interface: u8,
        in_endpoint: u8,
        out_endpoint: u8,
    },
    Bluetooth {
        address: String,
        rfcomm_channel: u8,
    },
    Hid {
        path: String,
    },
}

impl TransportDescriptor {
    /* Delay applied after `open` before the first I/O. */
    pub fn ready_delay(&self) -> Duration {
        match self {
            TransportDescriptor::Serial { .. } => Duration::from_millis(200),
            TransportDescriptor::Usb { .. } => Duration::from_millis(50),
            TransportDescriptor::Bluetooth { .. } => Duration::from_millis(500),
            TransportDescriptor::Hid { .. } => Duration::from_millis(20),
        }
    }
}

/* The capability set every transport backend implements. */
pub trait Transport: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<usize>;

    /* Read up to `buf.len()` bytes. `initial_timeout` bounds the wait for
     * the first byte; `subsequent_timeout` bounds the wait for each byte
     * after that. Returns `Ok(0)` on timeout rather than an error, so
     * callers can distinguish a quiet line from a dead one. */
    fn read(
        &mut self,
        buf: &mut [u8],
        initial_timeout: Duration,
        subsequent_timeout: Duration,
    ) -> Result<usize>;

    /* USB-only vendor control transfers; other transports return
     * `Unsupported`. */
    fn tell(&mut self, _request_code: u8, _value: u16, _index: u16, _data: &[u8]) -> Result<()> {
        Err(TransportError::Unsupported)
    }

    fn ask(&mut self, _request_code: u8, _value: u16, _index: u16, _out: &mut [u8]) -> Result<usize> {
        Err(TransportError::Unsupported)
    }

    /* HID-only report helpers; other transports return `Unsupported`. */
    fn set_hid_report(&mut self, _report: &[u8]) -> Result<()> {
        Err(TransportError::Unsupported)
    }

    fn get_hid_report(&mut self, _report_id: u8, _out: &mut [u8]) -> Result<usize> {
        Err(TransportError::Unsupported)
    }

    fn get_hid_descriptor(&mut self) -> Result<Vec<u8>> {
        Err(TransportError::Unsupported)
    }
}

/* Try each alternative in `descriptors` in order, returning the first one
 * that opens successfully. */
pub fn connect(descriptors: &[TransportDescriptor]) -> Result<Box<dyn Transport>> {
    let mut last_err = TransportError::Unsupported;
    for descriptor in descriptors {
        match open(descriptor) {
            Ok(t) => return Ok(t),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn open(descriptor: &TransportDescriptor) -> Result<Box<dyn Transport>> {
    match descriptor {
        #[cfg(feature = "transport-serial")]
        TransportDescriptor::Serial { path, baud } => {
            Ok(Box::new(serial::SerialTransport::open(path, *baud)?))
        }
        #[cfg(feature = "transport-usb")]
        TransportDescriptor::Usb {
            vendor_id,
            product_id,
            configuration,
            interface,
            in_endpoint,
            out_endpoint,
        } => Ok(Box::new(usb::UsbTransport::open(
            *vendor_id,
            *product_id,
            *configuration,
            *interface,
            *in_endpoint,
            *out_endpoint,
        )?)),
        #[cfg(feature = "transport-bluetooth")]
        TransportDescriptor::Bluetooth {
            address,
            rfcomm_channel,
        } => Ok(Box::new(bluetooth::BluetoothTransport::open(
            address,
            *rfcomm_channel,
        )?)),
        #[cfg(feature = "transport-hid")]
        TransportDescriptor::Hid { path } => Ok(Box::new(hid::HidTransport::open(path)?)),
        #[allow(unreachable_patterns)]
        _ => Err(TransportError::Unsupported),
    }
}
