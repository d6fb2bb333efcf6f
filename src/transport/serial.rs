/* Serial transport backend, built on the `serialport` crate. */
use std::time::Duration;

use tracing::debug;

use super::{Result, Transport, TransportError};

pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(500))
            .open()
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let n = std::io::Write::write(&mut self.port, bytes)?;
        debug!("serial TX {} bytes: {:02x?}", n, bytes);
        Ok(n)
    }

    fn read(
        &mut self,
        buf: &mut [u8],
        initial_timeout: Duration,
        subsequent_timeout: Duration,
    ) -> Result<usize> {
        self.port
            .set_timeout(initial_timeout)
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;

        let mut total = 0;
        while total < buf.len() {
            if total > 0 {
                self.port
                    .set_timeout(subsequent_timeout)
                    .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
            }
            match std::io::Read::read(&mut self.port, &mut buf[total..total + 1]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        debug!("serial RX {} bytes: {:02x?}", total, &buf[..total]);
        Ok(total)
    }
}
