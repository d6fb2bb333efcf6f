/* USB bulk-endpoint transport backend, built on the `rusb` crate (libusb
 * bindings). Opens by vendor/product id, claims the given interface, and
 * moves bytes over the given bulk endpoints. */
use std::time::Duration;

use tracing::debug;

use super::{Result, Transport, TransportError};

pub struct UsbTransport {
    handle: rusb::DeviceHandle<rusb::GlobalContext>,
    in_endpoint: u8,
    out_endpoint: u8,
}

impl UsbTransport {
    pub fn open(
        vendor_id: u16,
        product_id: u16,
        configuration: u8,
        interface: u8,
        in_endpoint: u8,
        out_endpoint: u8,
    ) -> Result<Self> {
        let handle = rusb::open_device_with_vid_pid(vendor_id, product_id)
            .ok_or(TransportError::Disconnected)?;
        handle
            .set_active_configuration(configuration)
            .map_err(io_err)?;
        handle.claim_interface(interface).map_err(io_err)?;
        Ok(Self {
            handle,
            in_endpoint,
            out_endpoint,
        })
    }
}

fn io_err(e: rusb::Error) -> TransportError {
    TransportError::Io(std::io::Error::other(e))
}

impl Transport for UsbTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let n = self
            .handle
            .write_bulk(self.out_endpoint, bytes, Duration::from_secs(1))
            .map_err(io_err)?;
        debug!("usb TX {} bytes: {:02x?}", n, bytes);
        Ok(n)
    }

    fn read(
        &mut self,
        buf: &mut [u8],
        initial_timeout: Duration,
        _subsequent_timeout: Duration,
    ) -> Result<usize> {
        match self.handle.read_bulk(self.in_endpoint, buf, initial_timeout) {
            Ok(n) => {
                debug!("usb RX {} bytes: {:02x?}", n, &buf[..n]);
                Ok(n)
            }
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(io_err(e)),
        }
    }

    fn tell(&mut self, request_code: u8, value: u16, index: u16, data: &[u8]) -> Result<()> {
        self.handle
            .write_control(
                rusb::request_type(
                    rusb::Direction::Out,
                    rusb::RequestType::Vendor,
                    rusb::Recipient::Device,
                ),
                request_code,
                value,
                index,
                data,
                Duration::from_secs(1),
            )
            .map_err(io_err)?;
        Ok(())
    }

    fn ask(&mut self, request_code: u8, value: u16, index: u16, out: &mut [u8]) -> Result<usize> {
        self.handle
            .read_control(
                rusb::request_type(
                    rusb::Direction::In,
                    rusb::RequestType::Vendor,
                    rusb::Recipient::Device,
                ),
                request_code,
                value,
                index,
                out,
                Duration::from_secs(1),
            )
            .map_err(io_err)
    }
}
