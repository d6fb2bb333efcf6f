/* In-memory transport used by driver tests: a pair of byte queues standing
 * in for "what the host wrote" and "what the device will reply with". Not
 * behind a feature flag since every driver's unit tests depend on it. */
use std::collections::VecDeque;
use std::time::Duration;

use super::{Result, Transport, TransportError};

#[derive(Default)]
pub struct MockTransport {
    pub written: Vec<u8>,
    inbox: VecDeque<u8>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /* Queue bytes the driver's next `read` calls will return. */
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbox.extend(bytes);
    }

    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }
}

impl Transport for MockTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        self.written.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn read(
        &mut self,
        buf: &mut [u8],
        _initial_timeout: Duration,
        _subsequent_timeout: Duration,
    ) -> Result<usize> {
        if self.inbox.is_empty() {
            return Ok(0);
        }
        let mut n = 0;
        while n < buf.len() {
            match self.inbox.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn get_hid_descriptor(&mut self) -> Result<Vec<u8>> {
        Err(TransportError::Unsupported)
    }
}
