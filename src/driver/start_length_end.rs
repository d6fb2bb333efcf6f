/* Start-length-end protocol family: a fixed sync byte, a one-byte model
 * identifier, a length field, the body, and (for driver-originated write
 * frames) an XOR checksum. Two drivers share this style — Cebra and
 * Papenmeier — with Cebra additionally requiring an acknowledgement
 * before the next write. */
use std::time::Duration;

use tracing::debug;

use crate::diff::DiffRange;
use crate::display::{Geometry, Identity};
use crate::keytable::matcher::Matcher;
use crate::keytable::{Context, Group, KeyEvent, KeyId, KeyName, KeyNameTable, KeyTable};
use crate::packet::Verdict;
use crate::transport::Transport;

use super::{drain_packets, match_events, read_one_packet, BrailleDriver, ConstructInfo, DriverError, DriverResult, ReadCommandOutcome};

const SYNC: u8 = 0x79;
const SUBSEQUENT_TIMEOUT: Duration = Duration::from_millis(100);

const NAMES: KeyNameTable = &[
    KeyName { name: "Dot1", key: KeyId { group: Group::DOT, number: 1 } },
    KeyName { name: "Dot2", key: KeyId { group: Group::DOT, number: 2 } },
    KeyName { name: "Dot3", key: KeyId { group: Group::DOT, number: 3 } },
    KeyName { name: "Dot4", key: KeyId { group: Group::DOT, number: 4 } },
    KeyName { name: "Dot5", key: KeyId { group: Group::DOT, number: 5 } },
    KeyName { name: "Dot6", key: KeyId { group: Group::DOT, number: 6 } },
    KeyName { name: "Dot7", key: KeyId { group: Group::DOT, number: 7 } },
    KeyName { name: "Dot8", key: KeyId { group: Group::DOT, number: 8 } },
    KeyName { name: "CursorLeft", key: KeyId { group: Group::NAVIGATION, number: 1 } },
    KeyName { name: "CursorRight", key: KeyId { group: Group::NAVIGATION, number: 2 } },
    KeyName { name: "RoutingKey", key: KeyId { group: Group::ROUTING, number: 0 } },
];

/* Inbound key-report frame: `SYNC, model_id, len, body[len]`, self-
 * terminating on the length field — no checksum, no trailing sentinel.
 * `body` is `[group, number, pressed, reserved]`. */
fn key_report_verifier(bytes: &[u8]) -> Verdict {
    if bytes.is_empty() {
        return Verdict::NeedMore { total_len: None };
    }
    if bytes[0] != SYNC {
        return Verdict::Invalid;
    }
    if bytes.len() < 3 {
        return Verdict::NeedMore { total_len: None };
    }
    let len = bytes[2] as usize;
    let total = 3 + len;
    if bytes.len() < total {
        return Verdict::NeedMore { total_len: Some(total) };
    }
    if bytes.len() > total {
        return Verdict::Invalid;
    }
    Verdict::IncludeAndFinish
}

/* Driver-originated write frame: `SYNC, model_id, len, body[len], checksum,
 * END`, with `checksum` the XOR of `body` and `END` a fixed sentinel. Both
 * built and parsed by this module, so the checksum algorithm only needs to
 * agree with itself. */
const WRITE_END: u8 = 0x0A;

fn build_write_frame(model_id: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(SYNC);
    out.push(model_id);
    out.push(body.len() as u8);
    out.extend_from_slice(body);
    out.push(body.iter().fold(0u8, |a, b| a ^ b));
    out.push(WRITE_END);
    out
}

fn write_frame_verifier(bytes: &[u8]) -> Verdict {
    if bytes.is_empty() {
        return Verdict::NeedMore { total_len: None };
    }
    if bytes[0] != SYNC {
        return Verdict::Invalid;
    }
    if bytes.len() < 3 {
        return Verdict::NeedMore { total_len: None };
    }
    let len = bytes[2] as usize;
    let total = 3 + len + 2;
    if bytes.len() < total {
        return Verdict::NeedMore { total_len: Some(total) };
    }
    if bytes.len() > total {
        return Verdict::Invalid;
    }
    let body = &bytes[3..3 + len];
    let checksum = body.iter().fold(0u8, |a, b| a ^ b);
    if bytes[total - 2] == checksum && bytes[total - 1] == WRITE_END {
        Verdict::IncludeAndFinish
    } else {
        Verdict::Invalid
    }
}

/* Single raw byte, used by Cebra as a write acknowledgement. */
const ACK_BYTE: u8 = 0x06;

fn ack_verifier(bytes: &[u8]) -> Verdict {
    match bytes.first() {
        None => Verdict::NeedMore { total_len: None },
        Some(&ACK_BYTE) if bytes.len() == 1 => Verdict::IncludeAndFinish,
        _ => Verdict::Invalid,
    }
}

/* One verifier that tries the ack byte first, then falls back to the
 * key-report frame shape; used by Cebra's read loop so a single reader can
 * see either kind of inbound data. */
fn cebra_inbound_verifier(bytes: &[u8]) -> Verdict {
    if bytes.first() == Some(&ACK_BYTE) {
        return ack_verifier(bytes);
    }
    key_report_verifier(bytes)
}

struct Profile {
    driver_code: &'static str,
    probe_request: &'static [u8],
    probe_reply_marker: u8,
    /* Maps the model-id byte carried in the probe reply (and in every
     * subsequent frame) to a text-column count. */
    model_table: &'static [(u8, usize)],
    ack_disciplined: bool,
    max_cells_per_packet: usize,
}

fn columns_for_model(table: &[(u8, usize)], model_id: u8) -> Option<usize> {
    table.iter().find(|(id, _)| *id == model_id).map(|(_, cols)| *cols)
}

struct StartLengthEndDriver {
    profile: Profile,
    transport: Option<Box<dyn Transport>>,
    reader: crate::packet::PacketReader,
    model_id: u8,
    resize_required: Option<usize>,
    ack_pending: bool,
}

impl StartLengthEndDriver {
    fn new(profile: Profile) -> Self {
        Self {
            profile,
            transport: None,
            reader: crate::packet::PacketReader::new(),
            model_id: 0,
            resize_required: None,
            ack_pending: false,
        }
    }

    fn construct(&mut self, mut transport: Box<dyn Transport>) -> DriverResult<ConstructInfo> {
        transport.write(self.profile.probe_request)?;

        let mut reply = [0u8; 2];
        let n = transport.read(&mut reply, Duration::from_millis(500), Duration::from_millis(200))?;
        if n < 2 || reply[0] != self.profile.probe_reply_marker {
            return Err(DriverError::ProbeFailed { attempts: 1 });
        }
        let model_id = reply[1];
        let Some(columns) = columns_for_model(self.profile.model_table, model_id) else {
            return Err(DriverError::ProbeFailed { attempts: 1 });
        };

        self.transport = Some(transport);
        self.model_id = model_id;

        Ok(ConstructInfo {
            identity: Identity {
                driver_code: self.profile.driver_code.to_string(),
                ..Identity::default()
            },
            geometry: Geometry::simple(columns, 1, 0),
        })
    }

    fn destruct(&mut self) {
        self.transport = None;
    }

    fn write_window(&mut self, cells: &[u8], range: Option<DiffRange>) -> DriverResult<()> {
        let Some(range) = range else {
            return Ok(());
        };
        if self.profile.ack_disciplined && self.ack_pending {
            debug!("{}: write deferred, ack still pending", self.profile.driver_code);
            return Ok(());
        }

        let transport = self.transport.as_mut().ok_or(DriverError::NotConstructed)?;
        let mut offset = range.from;
        while offset < range.to {
            let chunk_len = (range.to - offset).min(self.profile.max_cells_per_packet);
            let mut body = Vec::with_capacity(chunk_len + 1);
            body.push(offset as u8);
            body.extend_from_slice(&cells[offset..offset + chunk_len]);
            transport.write(&build_write_frame(self.model_id, &body))?;
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

        let verifier: &dyn crate::packet::PacketVerifier = if self.profile.ack_disciplined {
            &cebra_inbound_verifier
        } else {
            &key_report_verifier
        };

        let mut events = Vec::new();
        let mut resize: Option<usize> = None;
        let mut ack_seen = false;
        let model_table = self.profile.model_table;
        let current_model_id = self.model_id;

        let result = drain_packets(
            transport.as_mut(),
            &mut self.reader,
            verifier,
            Duration::from_millis(20),
            SUBSEQUENT_TIMEOUT,
            32,
            |frame| {
                if frame.len() == 1 && frame[0] == ACK_BYTE {
                    ack_seen = true;
                    return;
                }
                if frame.len() < 4 {
                    return;
                }
                let model_id = frame[1];
                if model_id != current_model_id {
                    if let Some(cols) = columns_for_model(model_table, model_id) {
                        resize = Some(cols);
                    }
                }
                /* Body is `[key_number, pressed, reserved, reserved]`; this
                 * packet type only ever reports dot keys, so the group is
                 * fixed rather than carried on the wire. */
                let body = &frame[3..];
                if body.len() >= 2 {
                    events.push(KeyEvent {
                        key: KeyId::new(Group::DOT, body[0]),
                        pressed: body[1] != 0,
                        timestamp_ms: now_ms,
                    });
                }
            },
        );

        if ack_seen {
            self.ack_pending = false;
        }
        if let Some(cols) = resize {
            /* Deferred: observed only at the next write. */
            self.resize_required = Some(cols);
        }

        if let Err(DriverError::Io(crate::transport::TransportError::Disconnected)) = result {
            return ReadCommandOutcome::Restart;
        }

        match_events(matcher, key_table, context, &events, now_ms)
    }
}

macro_rules! start_length_end_driver {
    ($name:ident, $code:literal, $probe_req:expr, $probe_marker:literal, $model_table:expr, $ack:literal, $max_cells:literal) => {
        pub struct $name(StartLengthEndDriver);

        impl $name {
            pub fn new() -> Self {
                Self(StartLengthEndDriver::new(Profile {
                    driver_code: $code,
                    probe_request: $probe_req,
                    probe_reply_marker: $probe_marker,
                    model_table: $model_table,
                    ack_disciplined: $ack,
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

            fn take_resize(&mut self) -> Option<usize> {
                self.0.resize_required.take()
            }
        }
    };
}

/* `0xF8` probe / `0xFE, model_id` reply: model `0x74` reports 40 columns. */
const CEBRA_MODEL_TABLE: &[(u8, usize)] = &[(0x74, 40), (0x75, 32), (0x76, 20)];
start_length_end_driver!(CebraDriver, "ce", &[0xF8], 0xFE, CEBRA_MODEL_TABLE, true, 62);

const PAPENMEIER_MODEL_TABLE: &[(u8, usize)] = &[(0x01, 80), (0x02, 44)];
start_length_end_driver!(PapenmeierDriver, "pm", &[0xF1], 0xF2, PAPENMEIER_MODEL_TABLE, false, 80);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Block;
    use crate::transport::mock::MockTransport;

    #[test]
    fn cebra_probe_sets_forty_columns() {
        let mut transport = MockTransport::new();
        transport.feed(&[0xFE, 0x74]);
        let mut driver = CebraDriver::new();
        let info = driver.0.construct(Box::new(transport)).unwrap();
        assert_eq!(info.geometry.text_columns, 40);
    }

    #[test]
    fn resync_past_garbage_emits_one_key_event() {
        let mut transport = MockTransport::new();
        transport.feed(&[0x42, 0x43, 0x79, 0x74, 0x04, 0x01, 0x03, 0x04, 0x07]);
        /* Press only arms the matcher; the release below is what actually
         * emits the command. */
        transport.feed(&[SYNC, 0x74, 0x04, 0x01, 0x00, 0x04, 0x07]);

        let mut driver = CebraDriver::new();
        driver.0.transport = Some(Box::new(transport));

        let path = std::env::temp_dir().join("brl-engine-cebra-test.ktb");
        std::fs::write(&path, "bind Dot1 HOME\n").unwrap();
        let table = crate::keytable::compiler::compile(&path, NAMES).unwrap();
        std::fs::remove_file(&path).ok();

        let mut matcher = Matcher::new();
        let outcome = driver.0.read_command(&mut matcher, &table, Context::Default, 0);
        match outcome {
            ReadCommandOutcome::Command(c) => assert_eq!(c.block(), Some(Block::Home)),
            other => panic!("expected a command, got {other:?}"),
        }
        assert_eq!(driver.0.reader.ignored_bytes(), 2);
    }

    #[test]
    fn model_id_change_sets_resize_required_until_taken() {
        let mut transport = MockTransport::new();
        transport.feed(&[SYNC, 0x75, 0x02, 1, 0]);

        let mut driver = CebraDriver::new();
        driver.0.model_id = 0x74;
        driver.0.transport = Some(Box::new(transport));

        let table = KeyTable { bindings: std::collections::HashMap::new() };
        let mut matcher = Matcher::new();
        driver.0.read_command(&mut matcher, &table, Context::Default, 0);

        assert_eq!(driver.take_resize(), Some(32));
        assert_eq!(driver.take_resize(), None, "resize is consumed once");
    }

    #[test]
    fn write_frame_round_trips_through_its_own_verifier() {
        let frame = build_write_frame(0x74, &[5, 1, 2, 3]);
        let mut reader = crate::packet::PacketReader::new();
        let mut delivered = None;
        for b in frame.iter().copied() {
            if let Some(p) = reader.push(b, &write_frame_verifier) {
                delivered = Some(p);
            }
        }
        assert_eq!(delivered, Some(frame));
    }

    #[test]
    fn write_frame_checksum_flip_is_dropped() {
        let mut frame = build_write_frame(0x74, &[5, 1, 2, 3]);
        let checksum_index = frame.len() - 2;
        frame[checksum_index] ^= 0x01;
        let mut reader = crate::packet::PacketReader::new();
        let mut delivered = None;
        for b in frame.iter().copied() {
            if let Some(p) = reader.push(b, &write_frame_verifier) {
                delivered = Some(p);
            }
        }
        assert_eq!(delivered, None);
    }

    #[test]
    fn ack_discipline_blocks_second_write_until_ack_arrives() {
        let mut transport = MockTransport::new();
        /* Queued up front: reads only drain this during `read_command`, so
         * feeding it before the writes below doesn't affect write ordering. */
        transport.feed(&[ACK_BYTE]);
        let mut driver = CebraDriver::new();
        driver.0.transport = Some(Box::new(transport));
        driver.0.model_id = 0x74;

        let cells = vec![0u8; 40];
        let mut changed = cells.clone();
        changed[5] = 1;
        driver.0.write_window(&changed, Some(DiffRange { from: 5, to: 6 })).unwrap();
        assert!(driver.0.ack_pending);

        let mut changed2 = changed.clone();
        changed2[6] = 1;
        driver.0.write_window(&changed2, Some(DiffRange { from: 6, to: 7 })).unwrap();

        let table = KeyTable { bindings: std::collections::HashMap::new() };
        let mut matcher = Matcher::new();
        driver.0.read_command(&mut matcher, &table, Context::Default, 0);
        assert!(!driver.0.ack_pending);
    }
}
