/* Escape-framed protocol family: a sentinel byte starts and ends every
 * frame; any body byte equal to the sentinel is
 * doubled when building and undoubled when parsing. Two drivers share this
 * exact framing style — HumanWare and Alva — differing only in their probe
 * and packet-type constants. */
use std::time::Duration;

use tracing::{debug, warn};

use crate::diff::DiffRange;
use crate::display::{Geometry, Identity};
use crate::keytable::matcher::Matcher;
use crate::keytable::{Context, Group, KeyEvent, KeyId, KeyName, KeyNameTable, KeyTable};
use crate::packet::Verdict;
use crate::transport::Transport;

use super::{drain_packets, match_events, read_one_packet, BrailleDriver, ConstructInfo, DriverError, DriverResult, ReadCommandOutcome};

const SENTINEL: u8 = 0xFA;
const PROBE_RETRY_LIMIT: u8 = 3;
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const SUBSEQUENT_TIMEOUT: Duration = Duration::from_millis(100);

fn build_packet(packet_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(payload.len() + 2);
    raw.push(packet_type);
    raw.extend_from_slice(payload);
    let checksum = raw.iter().fold(0u8, |a, b| a ^ b);
    raw.push(checksum);

    let mut out = Vec::with_capacity(raw.len() * 2 + 2);
    out.push(SENTINEL);
    for b in raw {
        out.push(b);
        if b == SENTINEL {
            out.push(SENTINEL);
        }
    }
    out.push(SENTINEL);
    out
}

/* Unescape a complete delivered frame (including both sentinels) back into
 * `(packet_type, payload)`, dropping the trailing checksum byte that the
 * verifier already validated. */
fn decode_packet(frame: &[u8]) -> (u8, Vec<u8>) {
    let mut body = Vec::new();
    let mut i = 1;
    while i < frame.len() - 1 {
        if frame[i] == SENTINEL {
            body.push(SENTINEL);
            i += 2;
        } else {
            body.push(frame[i]);
            i += 1;
        }
    }
    let packet_type = body[0];
    let payload = body[1..body.len() - 1].to_vec();
    (packet_type, payload)
}

fn verifier(bytes: &[u8]) -> Verdict {
    if bytes.is_empty() {
        return Verdict::NeedMore { total_len: None };
    }
    if bytes[0] != SENTINEL {
        return Verdict::Invalid;
    }
    let mut i = 1;
    let mut body = Vec::new();
    while i < bytes.len() {
        if bytes[i] == SENTINEL {
            if i + 1 == bytes.len() {
                return Verdict::NeedMore { total_len: None };
            }
            if bytes[i + 1] == SENTINEL {
                body.push(SENTINEL);
                i += 2;
                continue;
            }
            if body.len() < 2 {
                return Verdict::Invalid;
            }
            let checksum = body[body.len() - 1];
            let computed = body[..body.len() - 1].iter().fold(0u8, |a, b| a ^ b);
            return if checksum == computed {
                Verdict::IncludeAndFinish
            } else {
                Verdict::Invalid
            };
        }
        body.push(bytes[i]);
        i += 1;
    }
    Verdict::NeedMore { total_len: None }
}

struct Profile {
    driver_code: &'static str,
    probe_request_type: u8,
    probe_reply_type: u8,
    key_packet_type: u8,
    write_packet_type: u8,
    max_cells_per_packet: usize,
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
    KeyName { name: "LeftAdvance", key: KeyId { group: Group::NAVIGATION, number: 1 } },
    KeyName { name: "RightAdvance", key: KeyId { group: Group::NAVIGATION, number: 2 } },
    KeyName { name: "RoutingKey", key: KeyId { group: Group::ROUTING, number: 0 } },
];

struct EscapeFramedDriver {
    profile: Profile,
    transport: Option<Box<dyn Transport>>,
    reader: crate::packet::PacketReader,
}

impl EscapeFramedDriver {
    fn new(profile: Profile) -> Self {
        Self {
            profile,
            transport: None,
            reader: crate::packet::PacketReader::new(),
        }
    }

    fn construct(&mut self, mut transport: Box<dyn Transport>) -> DriverResult<ConstructInfo> {
        let mut reader = crate::packet::PacketReader::new();
        let mut cell_count = None;

        for attempt in 0..PROBE_RETRY_LIMIT {
            transport.write(&build_packet(self.profile.probe_request_type, &[]))?;
            if let Some(frame) = read_one_packet(
                transport.as_mut(),
                &mut reader,
                &verifier,
                PROBE_TIMEOUT,
                SUBSEQUENT_TIMEOUT,
            )? {
                let (packet_type, payload) = decode_packet(&frame);
                if packet_type == self.profile.probe_reply_type && !payload.is_empty() {
                    cell_count = Some(payload[0] as usize);
                    break;
                }
                warn!("{}: unexpected probe reply type {packet_type:#04x}", self.profile.driver_code);
            }
            debug!("{}: probe attempt {attempt} produced no match", self.profile.driver_code);
        }

        let Some(cells) = cell_count else {
            return Err(DriverError::ProbeFailed { attempts: PROBE_RETRY_LIMIT });
        };

        self.transport = Some(transport);
        self.reader = reader;

        Ok(ConstructInfo {
            identity: Identity {
                driver_code: self.profile.driver_code.to_string(),
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
            let chunk_len = (range.to - offset).min(self.profile.max_cells_per_packet);
            let mut payload = Vec::with_capacity(chunk_len + 2);
            payload.push(offset as u8);
            payload.push(chunk_len as u8);
            payload.extend_from_slice(&cells[offset..offset + chunk_len]);
            transport.write(&build_packet(self.profile.write_packet_type, &payload))?;
            offset += chunk_len;
        }
        Ok(())
    }

    fn read_command(&mut self, matcher: &mut Matcher, key_table: &KeyTable, context: Context, now_ms: u64) -> ReadCommandOutcome {
        let Some(transport) = self.transport.as_mut() else {
            return ReadCommandOutcome::Eof;
        };

        let mut events = Vec::new();
        let key_packet_type = self.profile.key_packet_type;
        let result = drain_packets(
            transport.as_mut(),
            &mut self.reader,
            &verifier,
            Duration::from_millis(20),
            SUBSEQUENT_TIMEOUT,
            32,
            |frame| {
                let (packet_type, payload) = decode_packet(frame);
                if packet_type == key_packet_type && payload.len() >= 3 {
                    events.push(KeyEvent {
                        key: KeyId::new(Group(payload[0]), payload[1]),
                        pressed: payload[2] != 0,
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

macro_rules! escape_framed_driver {
    ($name:ident, $code:literal, $probe_req:literal, $probe_reply:literal, $key_type:literal, $write_type:literal, $max_cells:literal) => {
        pub struct $name(EscapeFramedDriver);

        impl $name {
            pub fn new() -> Self {
                Self(EscapeFramedDriver::new(Profile {
                    driver_code: $code,
                    probe_request_type: $probe_req,
                    probe_reply_type: $probe_reply,
                    key_packet_type: $key_type,
                    write_packet_type: $write_type,
                    max_cells_per_packet: $max_cells,
                }))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl BrailleDriver for $name {
            fn code(&self) -> &'static str {
                $code
            }

            fn name_table(&self) -> KeyNameTable {
                NAMES
            }

            fn construct(&mut self, transport: Box<dyn Transport>) -> DriverResult<ConstructInfo> {
                self.0.construct(transport)
            }

            fn destruct(&mut self) {
                self.0.destruct()
            }

            fn write_window(&mut self, cells: &[u8], range: Option<DiffRange>) -> DriverResult<()> {
                self.0.write_window(cells, range)
            }

            fn read_command(&mut self, matcher: &mut Matcher, key_table: &KeyTable, context: Context, now_ms: u64) -> ReadCommandOutcome {
                self.0.read_command(matcher, key_table, context, now_ms)
            }
        }
    };
}

escape_framed_driver!(HumanWareDriver, "hw", 0x01, 0x81, 0x10, 0x20, 64);
escape_framed_driver!(AlvaDriver, "al", 0x02, 0x82, 0x10, 0x20, 40);
