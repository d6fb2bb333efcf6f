/* Ack/Nak-with-control-bytes protocol family: the first byte alone picks
 * the frame's shape out of {ack, nak, id reply, key report}, so there is
 * no explicit length field; multi-byte frames carry an 8-bit sum checksum
 * as their trailer. Two drivers share this style — DotPad and HandyTech —
 * with DotPad additionally requiring an acknowledgement before the next
 * write. */
use std::time::Duration;

use tracing::{debug, warn};

use crate::diff::DiffRange;
use crate::display::{Geometry, Identity};
use crate::keytable::matcher::Matcher;
use crate::keytable::{Context, Group, KeyEvent, KeyId, KeyName, KeyNameTable, KeyTable};
use crate::packet::Verdict;
use crate::transport::Transport;

use super::{drain_packets, match_events, read_one_packet, BrailleDriver, ConstructInfo, DriverError, DriverResult, ReadCommandOutcome};

const FIRST_ACK: u8 = 0x06;
const FIRST_NAK: u8 = 0x15;
const FIRST_ID: u8 = 0x02;
const FIRST_KEY: u8 = 0x01;
const FIRST_WRITE: u8 = 0x03;

const PROBE_RETRY_LIMIT: u8 = 3;
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const SUBSEQUENT_TIMEOUT: Duration = Duration::from_millis(100);

fn checksum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |a, b| a.wrapping_add(*b))
}

/* Every shape this family's first byte can pick, and the frame's total
 * length (`None` for an unrecognized first byte). */
fn frame_len(first: u8) -> Option<usize> {
    match first {
        FIRST_ACK | FIRST_NAK => Some(1),
        FIRST_ID => Some(3),
        FIRST_KEY => Some(5),
        _ => None,
    }
}

fn verifier(bytes: &[u8]) -> Verdict {
    if bytes.is_empty() {
        return Verdict::NeedMore { total_len: None };
    }
    let Some(total) = frame_len(bytes[0]) else {
        return Verdict::Invalid;
    };
    if total == 1 {
        return if bytes.len() == 1 {
            Verdict::IncludeAndFinish
        } else {
            Verdict::Invalid
        };
    }
    if bytes.len() < total {
        return Verdict::NeedMore { total_len: Some(total) };
    }
    if bytes.len() > total {
        return Verdict::Invalid;
    }
    let computed = checksum8(&bytes[..total - 1]);
    if computed == bytes[total - 1] {
        Verdict::IncludeAndFinish
    } else {
        Verdict::Invalid
    }
}

fn build_write_frame(offset: u8, chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunk.len() + 3);
    out.push(FIRST_WRITE);
    out.push(offset);
    out.push(chunk.len() as u8);
    out.extend_from_slice(chunk);
    let checksum = checksum8(&out);
    out.push(checksum);
    out
}

struct Profile {
    driver_code: &'static str,
    probe_request: &'static [u8],
    ack_disciplined: bool,
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
    KeyName { name: "PanLeft", key: KeyId { group: Group::NAVIGATION, number: 1 } },
    KeyName { name: "PanRight", key: KeyId { group: Group::NAVIGATION, number: 2 } },
    KeyName { name: "RoutingKey", key: KeyId { group: Group::ROUTING, number: 0 } },
];

struct AckNakDriver {
    profile: Profile,
    transport: Option<Box<dyn Transport>>,
    reader: crate::packet::PacketReader,
    ack_pending: bool,
}

impl AckNakDriver {
    fn new(profile: Profile) -> Self {
        Self {
            profile,
            transport: None,
            reader: crate::packet::PacketReader::new(),
            ack_pending: false,
        }
    }

    fn construct(&mut self, mut transport: Box<dyn Transport>) -> DriverResult<ConstructInfo> {
        let mut reader = crate::packet::PacketReader::new();
        let mut cell_count = None;

        for attempt in 0..PROBE_RETRY_LIMIT {
            transport.write(self.profile.probe_request)?;
            if let Some(frame) = read_one_packet(
                transport.as_mut(),
                &mut reader,
                &verifier,
                PROBE_TIMEOUT,
                SUBSEQUENT_TIMEOUT,
            )? {
                if frame[0] == FIRST_ID {
                    cell_count = Some(frame[1] as usize);
                    break;
                }
                warn!("{}: unexpected probe reply first byte {:#04x}", self.profile.driver_code, frame[0]);
            }
            debug!("{}: probe attempt {attempt} produced no match", self.profile.driver_code);
        }

        let Some(cells) = cell_count else {
            return Err(DriverError::ProbeFailed { attempts: PROBE_RETRY_LIMIT });
        };

        self.transport = Some(transport);
        self.reader = reader;
        self.ack_pending = false;

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
        self.ack_pending = false;
    }

    fn write_window(&mut self, cells: &[u8], range: Option<DiffRange>) -> DriverResult<()> {
        if self.profile.ack_disciplined && self.ack_pending {
            return Ok(());
        }
        let Some(range) = range else {
            return Ok(());
        };
        let transport = self.transport.as_mut().ok_or(DriverError::NotConstructed)?;

        let mut offset = range.from;
        while offset < range.to {
            let chunk_len = (range.to - offset).min(self.profile.max_cells_per_packet);
            transport.write(&build_write_frame(offset as u8, &cells[offset..offset + chunk_len]))?;
            offset += chunk_len;
        }
        if self.profile.ack_disciplined {
            self.ack_pending = true;
        }
        Ok(())
    }

    fn read_command(&mut self, matcher: &mut Matcher, key_table: &KeyTable, context: Context, now_ms: u64) -> ReadCommandOutcome {
        let Some(transport) = self.transport.as_mut() else {
            return ReadCommandOutcome::Eof;
        };

        let mut events = Vec::new();
        let mut ack_seen = false;
        let result = drain_packets(
            transport.as_mut(),
            &mut self.reader,
            &verifier,
            Duration::from_millis(20),
            SUBSEQUENT_TIMEOUT,
            32,
            |frame| match frame[0] {
                FIRST_ACK => ack_seen = true,
                FIRST_NAK => warn!("device reported NAK"),
                FIRST_KEY if frame.len() >= 4 => {
                    events.push(KeyEvent {
                        key: KeyId::new(Group(frame[1]), frame[2]),
                        pressed: frame[3] != 0,
                        timestamp_ms: now_ms,
                    });
                }
                _ => {}
            },
        );

        if ack_seen {
            self.ack_pending = false;
        }

        if let Err(DriverError::Io(crate::transport::TransportError::Disconnected)) = result {
            return ReadCommandOutcome::Restart;
        }

        match_events(matcher, key_table, context, &events, now_ms)
    }
}

macro_rules! ack_nak_driver {
    ($name:ident, $code:literal, $probe_req:expr, $ack_disciplined:literal, $max_cells:literal) => {
        pub struct $name(AckNakDriver);

        impl $name {
            pub fn new() -> Self {
                Self(AckNakDriver::new(Profile {
                    driver_code: $code,
                    probe_request: $probe_req,
                    ack_disciplined: $ack_disciplined,
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

ack_nak_driver!(DotPadDriver, "dp", &[0xF5], true, 60);
ack_nak_driver!(HandyTechDriver, "ht", &[0xF6], false, 80);
