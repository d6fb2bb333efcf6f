/* Magic-header protocol family: a fixed two-byte magic, a command/subcode
 * pair, and a little-endian 16-bit length that covers only the body. No
 * checksum. BrailleMemo is the sole driver in this family. */
use std::time::Duration;

use tracing::{debug, warn};

use crate::diff::DiffRange;
use crate::display::{Geometry, Identity};
use crate::keytable::matcher::Matcher;
use crate::keytable::{Context, Group, KeyEvent, KeyId, KeyName, KeyNameTable, KeyTable};
use crate::packet::Verdict;
use crate::transport::Transport;

use super::{drain_packets, match_events, read_one_packet, BrailleDriver, ConstructInfo, DriverError, DriverResult, ReadCommandOutcome};

const MAGIC: [u8; 2] = [0xBE, 0xEF];
const PROBE_RETRY_LIMIT: u8 = 3;
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const SUBSEQUENT_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_CELLS_PER_PACKET: usize = 64;

const CMD_PROBE: u8 = 0x01;
const CMD_PROBE_REPLY: u8 = 0x81;
const CMD_KEY: u8 = 0x10;
const CMD_WRITE: u8 = 0x20;

fn build_packet(command: u8, subcode: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + body.len());
    out.extend_from_slice(&MAGIC);
    out.push(command);
    out.push(subcode);
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn decode_packet(frame: &[u8]) -> (u8, u8, Vec<u8>) {
    (frame[2], frame[3], frame[6..].to_vec())
}

fn verifier(bytes: &[u8]) -> Verdict {
    let prefix_len = bytes.len().min(MAGIC.len());
    if bytes[..prefix_len] != MAGIC[..prefix_len] {
        return Verdict::Invalid;
    }
    if bytes.len() < MAGIC.len() {
        return Verdict::NeedMore { total_len: None };
    }
    if bytes.len() < 6 {
        return Verdict::NeedMore { total_len: None };
    }
    let len = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
    let total = 6 + len;
    if bytes.len() < total {
        return Verdict::NeedMore { total_len: Some(total) };
    }
    if bytes.len() > total {
        return Verdict::Invalid;
    }
    Verdict::IncludeAndFinish
}

const NAMES: KeyNameTable = &[
    KeyName { name: "Dot1", key: KeyId { group: Group::DOT, number: 1 } },
    KeyName { name: "Dot2", key: KeyId { group: Group::DOT, number: 2 } },
    KeyName { name: "Dot3", key: KeyId { group: Group::DOT, number: 3 } },
    KeyName { name: "Dot4", key: KeyId { group: Group::DOT, number: 4 } },
    KeyName { name: "Dot5", key: KeyId { group: Group::DOT, number: 5 } },
    KeyName { name: "Dot6", key: KeyId { group: Group::DOT, number: 6 } },
    KeyName { name: "Dot7", key: KeyId { group: Group::DOT, number: 7 } },
    KeyName { name: "Dot8", key: KeyId { group: Group::DOT, number: 8 } },
    KeyName { name: "Space", key: KeyId { group: Group::NAVIGATION, number: 1 } },
    KeyName { name: "RoutingKey", key: KeyId { group: Group::ROUTING, number: 0 } },
];

pub struct BrailleMemoDriver {
    transport: Option<Box<dyn Transport>>,
    reader: crate::packet::PacketReader,
}

impl BrailleMemoDriver {
    pub fn new() -> Self {
        Self {
            transport: None,
            reader: crate::packet::PacketReader::new(),
        }
    }
}

impl Default for BrailleMemoDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl BrailleMemoDriver {
    pub(crate) fn set_transport_for_test(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }
}

/* A `CMD_KEY` frame for `group = Group::DOT`, used by `engine`'s tests to
 * drive a driver end-to-end without reaching into this module's private
 * framing internals. */
#[cfg(test)]
pub(crate) fn test_key_packet(key_number: u8, pressed: bool) -> Vec<u8> {
    build_packet(CMD_KEY, Group::DOT.0, &[key_number, pressed as u8])
}

impl BrailleDriver for BrailleMemoDriver {
    fn code(&self) -> &'static str {
        "bm"
    }

    fn name_table(&self) -> KeyNameTable {
        NAMES
    }

    fn construct(&mut self, mut transport: Box<dyn Transport>) -> DriverResult<ConstructInfo> {
        let mut reader = crate::packet::PacketReader::new();
        let mut cell_count = None;

        for attempt in 0..PROBE_RETRY_LIMIT {
            transport.write(&build_packet(CMD_PROBE, 0x00, &[]))?;
            if let Some(frame) = read_one_packet(
                transport.as_mut(),
                &mut reader,
                &verifier,
                PROBE_TIMEOUT,
                SUBSEQUENT_TIMEOUT,
            )? {
                let (command, _subcode, body) = decode_packet(&frame);
                if command == CMD_PROBE_REPLY && !body.is_empty() {
                    cell_count = Some(body[0] as usize);
                    break;
                }
                warn!("bm: unexpected probe reply command {command:#04x}");
            }
            debug!("bm: probe attempt {attempt} produced no match");
        }

        let Some(cells) = cell_count else {
            return Err(DriverError::ProbeFailed { attempts: PROBE_RETRY_LIMIT });
        };

        self.transport = Some(transport);
        self.reader = reader;

        Ok(ConstructInfo {
            identity: Identity {
                driver_code: "bm".to_string(),
                ..Identity::default()
            },
            geometry: Geometry::simple(cells, 1, 0),
        })
    }

    fn destruct(&mut self) {
        self.transport = None;
    }

    fn write_window(&mut self, cells: &[u8], range: Option<DiffRange>) -> DriverResult<()> {
        let Some(range) = range else {
            return Ok(());
        };
        let transport = self.transport.as_mut().ok_or(DriverError::NotConstructed)?;

        let mut offset = range.from;
        while offset < range.to {
            let chunk_len = (range.to - offset).min(MAX_CELLS_PER_PACKET);
            let mut payload = Vec::with_capacity(chunk_len + 2);
            payload.push(offset as u8);
            payload.push(chunk_len as u8);
            payload.extend_from_slice(&cells[offset..offset + chunk_len]);
            transport.write(&build_packet(CMD_WRITE, 0x00, &payload))?;
            offset += chunk_len;
        }
        Ok(())
    }

    fn read_command(&mut self, matcher: &mut Matcher, key_table: &KeyTable, context: Context, now_ms: u64) -> ReadCommandOutcome {
        let Some(transport) = self.transport.as_mut() else {
            return ReadCommandOutcome::Eof;
        };

        let mut events = Vec::new();
        let result = drain_packets(
            transport.as_mut(),
            &mut self.reader,
            &verifier,
            Duration::from_millis(20),
            SUBSEQUENT_TIMEOUT,
            32,
            |frame| {
                let (command, subcode, body) = decode_packet(frame);
                if command == CMD_KEY && body.len() >= 2 {
                    events.push(KeyEvent {
                        key: KeyId::new(Group(subcode), body[0]),
                        pressed: body[1] != 0,
                        timestamp_ms: now_ms,
                    });
                }
            },
        );

        if let Err(DriverError::Io(crate::transport::TransportError::Disconnected)) = result {
            return ReadCommandOutcome::Restart;
        }

        match_events(matcher, key_table, context, &events, now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Block;
    use crate::transport::mock::MockTransport;

    #[test]
    fn probe_round_trip_sets_cell_count() {
        let mut transport = MockTransport::new();
        transport.feed(&build_packet(CMD_PROBE_REPLY, 0x00, &[32]));
        let mut driver = BrailleMemoDriver::new();
        let info = driver.construct(Box::new(transport)).unwrap();
        assert_eq!(info.geometry.text_columns, 32);
    }

    #[test]
    fn probe_failure_after_retry_limit_reports_error() {
        let transport = MockTransport::new();
        let mut driver = BrailleMemoDriver::new();
        let err = driver.construct(Box::new(transport)).unwrap_err();
        assert!(matches!(err, DriverError::ProbeFailed { attempts: 3 }));
    }

    #[test]
    fn write_window_emits_offset_length_body_with_no_checksum() {
        use std::sync::{Arc, Mutex};

        struct RecordingTransport(Arc<Mutex<Vec<u8>>>);
        impl Transport for RecordingTransport {
            fn write(&mut self, bytes: &[u8]) -> crate::transport::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(bytes);
                Ok(bytes.len())
            }
            fn read(&mut self, _buf: &mut [u8], _i: Duration, _s: Duration) -> crate::transport::Result<usize> {
                Ok(0)
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut driver = BrailleMemoDriver::new();
        driver.transport = Some(Box::new(RecordingTransport(log.clone())));
        let cells = [0u8, 0, 0xAB, 0];
        driver.write_window(&cells, Some(DiffRange { from: 2, to: 3 })).unwrap();
        let expected = build_packet(CMD_WRITE, 0x00, &[2, 1, 0xAB]);
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[test]
    fn key_packet_resyncs_past_garbage_and_emits_one_event() {
        let mut transport = MockTransport::new();
        transport.feed(&[0x11, 0xEF, 0xBE]);
        transport.feed(&build_packet(CMD_KEY, Group::DOT.0, &[1, 1]));
        transport.feed(&build_packet(CMD_KEY, Group::DOT.0, &[1, 0]));

        let mut driver = BrailleMemoDriver::new();
        driver.transport = Some(Box::new(transport));

        let path = std::env::temp_dir().join("brl-engine-bm-test.ktb");
        std::fs::write(&path, "bind Dot1 HOME\n").unwrap();
        let table = crate::keytable::compiler::compile(&path, NAMES).unwrap();
        std::fs::remove_file(&path).ok();

        let mut matcher = Matcher::new();
        let outcome = driver.read_command(&mut matcher, &table, Context::Default, 0);
        match outcome {
            ReadCommandOutcome::Command(c) => assert_eq!(c.block(), Some(Block::Home)),
            other => panic!("expected a command, got {other:?}"),
        }
        assert_eq!(driver.reader.ignored_bytes(), 3);
    }
}
