/* ASCII-escaped-line protocol family: every frame starts with an ESC byte
 * and a one-byte code; for the frame types this
 * driver must parse off the wire (probe reply, key report), the code
 * alone picks the body's length. A literal ESC inside the body is
 * doubled when building and undoubled when parsing; an undoubled ESC
 * marks a frame boundary, which is what lets the reader resynchronize.
 * Voyager is the sole driver in this family; it does not need a length
 * table for its own outbound write frames since it never reads them
 * back, so those carry an explicit offset/count header instead. */
use std::time::Duration;

use tracing::{debug, warn};

use crate::diff::{project_hidden, DiffRange};
use crate::display::{Geometry, Identity};
use crate::keytable::matcher::Matcher;
use crate::keytable::{Context, Group, KeyEvent, KeyId, KeyName, KeyNameTable, KeyTable};
use crate::packet::Verdict;
use crate::transport::Transport;

use super::{drain_packets, match_events, read_one_packet, BrailleDriver, ConstructInfo, DriverError, DriverResult, ReadCommandOutcome};

const ESC: u8 = 0x1B;
const ACK_BYTE: u8 = 0x06;

const CODE_PROBE: u8 = 0x01;
const CODE_PROBE_REPLY: u8 = 0x81;
const CODE_KEY: u8 = 0x10;
const CODE_WRITE: u8 = 0x20;

const PROBE_RETRY_LIMIT: u8 = 3;
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const SUBSEQUENT_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_CELLS_PER_PACKET: usize = 60;

/* Raw (unescaped) body length for each inbound code this driver parses.
 * Outbound write frames aren't looked up here — see the module doc. */
fn code_len(code: u8) -> Option<usize> {
    match code {
        CODE_PROBE_REPLY => Some(1),
        CODE_KEY => Some(3),
        _ => None,
    }
}

fn build_packet(code: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(ESC);
    out.push(code);
    for &b in body {
        out.push(b);
        if b == ESC {
            out.push(ESC);
        }
    }
    out
}

fn decode_packet(frame: &[u8]) -> (u8, Vec<u8>) {
    let code = frame[1];
    let mut body = Vec::new();
    let mut i = 2;
    while i < frame.len() {
        if frame[i] == ESC {
            body.push(ESC);
            i += 2;
        } else {
            body.push(frame[i]);
            i += 1;
        }
    }
    (code, body)
}

fn verifier(bytes: &[u8]) -> Verdict {
    if bytes.is_empty() {
        return Verdict::NeedMore { total_len: None };
    }
    if bytes[0] == ACK_BYTE {
        return if bytes.len() == 1 { Verdict::IncludeAndFinish } else { Verdict::Invalid };
    }
    if bytes[0] != ESC {
        return Verdict::Invalid;
    }
    if bytes.len() < 2 {
        return Verdict::NeedMore { total_len: None };
    }
    let Some(body_len) = code_len(bytes[1]) else {
        return Verdict::Invalid;
    };

    let mut raw = 0usize;
    let mut i = 2;
    while i < bytes.len() {
        if bytes[i] == ESC {
            if i + 1 == bytes.len() {
                return Verdict::NeedMore { total_len: None };
            }
            if bytes[i + 1] != ESC {
                return Verdict::Invalid;
            }
            raw += 1;
            i += 2;
        } else {
            raw += 1;
            i += 1;
        }
        if raw == body_len {
            return if i == bytes.len() { Verdict::IncludeAndFinish } else { Verdict::Invalid };
        }
    }
    Verdict::NeedMore { total_len: None }
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
    KeyName { name: "PanLeft", key: KeyId { group: Group::NAVIGATION, number: 1 } },
    KeyName { name: "PanRight", key: KeyId { group: Group::NAVIGATION, number: 2 } },
    KeyName { name: "RoutingKey", key: KeyId { group: Group::ROUTING, number: 0 } },
];

pub struct VoyagerDriver {
    transport: Option<Box<dyn Transport>>,
    reader: crate::packet::PacketReader,
    /* Voyager-48's physical layout has a 2-cell unaddressable lead-in before
     * every usable cell. */
    usable_to_physical: Vec<usize>,
    physical_len: usize,
}

impl VoyagerDriver {
    pub fn new() -> Self {
        Self {
            transport: None,
            reader: crate::packet::PacketReader::new(),
            usable_to_physical: Vec::new(),
            physical_len: 0,
        }
    }
}

impl Default for VoyagerDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl BrailleDriver for VoyagerDriver {
    fn code(&self) -> &'static str {
        "vo"
    }

    fn name_table(&self) -> KeyNameTable {
        NAMES
    }

    fn construct(&mut self, mut transport: Box<dyn Transport>) -> DriverResult<ConstructInfo> {
        let mut reader = crate::packet::PacketReader::new();
        let mut cell_count = None;

        for attempt in 0..PROBE_RETRY_LIMIT {
            transport.write(&build_packet(CODE_PROBE, &[]))?;
            if let Some(frame) = read_one_packet(
                transport.as_mut(),
                &mut reader,
                &verifier,
                PROBE_TIMEOUT,
                SUBSEQUENT_TIMEOUT,
            )? {
                let (code, body) = decode_packet(&frame);
                if code == CODE_PROBE_REPLY && !body.is_empty() {
                    cell_count = Some(body[0] as usize);
                    break;
                }
                warn!("vo: unexpected probe reply code {code:#04x}");
            }
            debug!("vo: probe attempt {attempt} produced no match");
        }

        let Some(cells) = cell_count else {
            return Err(DriverError::ProbeFailed { attempts: PROBE_RETRY_LIMIT });
        };

        self.transport = Some(transport);
        self.reader = reader;
        self.usable_to_physical = (0..cells).map(|i| i + 2).collect();
        self.physical_len = cells + 2;

        Ok(ConstructInfo {
            identity: Identity {
                driver_code: "vo".to_string(),
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
        let projected = project_hidden(range, &self.usable_to_physical);

        let mut offset = range.from;
        let mut physical_offset = projected.from;
        while offset < range.to {
            let chunk_len = (range.to - offset).min(MAX_CELLS_PER_PACKET);
            let mut payload = Vec::with_capacity(chunk_len + 2);
            payload.push(physical_offset as u8);
            payload.push(chunk_len as u8);
            payload.extend_from_slice(&cells[offset..offset + chunk_len]);
            transport.write(&build_packet(CODE_WRITE, &payload))?;
            offset += chunk_len;
            physical_offset += chunk_len;
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
                if frame[0] == ACK_BYTE {
                    return;
                }
                let (code, body) = decode_packet(frame);
                if code == CODE_KEY && body.len() >= 3 {
                    events.push(KeyEvent {
                        key: KeyId::new(Group(body[0]), body[1]),
                        pressed: body[2] != 0,
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

    fn hidden_layout(&self) -> Option<&[usize]> {
        Some(&self.usable_to_physical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Block;
    use crate::transport::mock::MockTransport;

    #[test]
    fn probe_round_trip_sets_cell_count_and_physical_layout() {
        let mut transport = MockTransport::new();
        transport.feed(&build_packet(CODE_PROBE_REPLY, &[44]));
        let mut driver = VoyagerDriver::new();
        let info = driver.construct(Box::new(transport)).unwrap();
        assert_eq!(info.geometry.text_columns, 44);
        assert_eq!(driver.physical_len, 46);
        assert_eq!(driver.usable_to_physical[0], 2);
        assert_eq!(driver.usable_to_physical[43], 45);
    }

    #[test]
    fn probe_failure_after_retry_limit_reports_error() {
        let transport = MockTransport::new();
        let mut driver = VoyagerDriver::new();
        let err = driver.construct(Box::new(transport)).unwrap_err();
        assert!(matches!(err, DriverError::ProbeFailed { attempts: 3 }));
    }

    #[test]
    fn write_diff_applies_the_two_cell_hidden_lead_in() {
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
        let mut driver = VoyagerDriver::new();
        driver.transport = Some(Box::new(RecordingTransport(log.clone())));
        driver.usable_to_physical = (0..44).map(|i| i + 2).collect();
        driver.physical_len = 46;

        let mut cells = [0u8; 44];
        cells[22] = 0x15;
        driver.write_window(&cells, Some(DiffRange { from: 22, to: 23 })).unwrap();

        let expected = build_packet(CODE_WRITE, &[24, 1, 0x15]);
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[test]
    fn key_packet_resyncs_past_garbage_and_emits_one_event() {
        let mut transport = MockTransport::new();
        transport.feed(&[0x40, 0x41]);
        transport.feed(&build_packet(CODE_KEY, &[Group::DOT.0, 1, 1]));
        transport.feed(&build_packet(CODE_KEY, &[Group::DOT.0, 1, 0]));

        let mut driver = VoyagerDriver::new();
        driver.transport = Some(Box::new(transport));

        let path = std::env::temp_dir().join("brl-engine-vo-test.ktb");
        std::fs::write(&path, "bind Dot1 HOME\n").unwrap();
        let table = crate::keytable::compiler::compile(&path, NAMES).unwrap();
        std::fs::remove_file(&path).ok();

        let mut matcher = Matcher::new();
        let outcome = driver.read_command(&mut matcher, &table, Context::Default, 0);
        match outcome {
            ReadCommandOutcome::Command(c) => assert_eq!(c.block(), Some(Block::Home)),
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[test]
    fn ack_byte_is_consumed_without_producing_a_key_event() {
        let mut transport = MockTransport::new();
        transport.feed(&[ACK_BYTE]);
        let mut driver = VoyagerDriver::new();
        driver.transport = Some(Box::new(transport));

        let path = std::env::temp_dir().join("brl-engine-vo-ack-test.ktb");
        std::fs::write(&path, "bind Dot1 HOME\n").unwrap();
        let table = crate::keytable::compiler::compile(&path, NAMES).unwrap();
        std::fs::remove_file(&path).ok();

        let mut matcher = Matcher::new();
        let outcome = driver.read_command(&mut matcher, &table, Context::Default, 0);
        assert!(matches!(outcome, ReadCommandOutcome::Pending { .. }));
    }
}
