/* Driver framework: the `BrailleDriver` trait every protocol implements,
 * the shared byte-at-a-time read loop built on `packet::PacketReader`, and
 * the code->driver registry. */
pub mod ack_nak;
pub mod ascii_escaped;
pub mod escape_framed;
pub mod hid_descriptor;
pub mod hid_driver;
pub mod magic_header;
pub mod start_length_end;

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::command::Command;
use crate::display::{Geometry, Identity};
use crate::keytable::matcher::Matcher;
use crate::keytable::{KeyEvent, KeyNameTable, KeyTable};
use crate::packet::{PacketReader, PacketVerifier};
use crate::transport::Transport;

/* Domain-specific error variants for all driver I/O operations. */
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("I/O failure: {0}")]
    Io(#[from] crate::transport::TransportError),

    #[error("probe failed after {attempts} attempt(s)")]
    ProbeFailed { attempts: u8 },

    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch { computed: u8, received: u8 },

    #[error("unexpected packet type {0:#04x}")]
    UnexpectedPacket(u8),

    #[error("device reported a protocol error (code {0:#04x})")]
    ProtocolError(u8),

    #[error("descriptor parse error: {0}")]
    Descriptor(String),

    #[error("write failed after {attempts} retries")]
    WriteRetriesExhausted { attempts: u8 },

    #[error("operation attempted before construct() succeeded")]
    NotConstructed,
}

pub type DriverResult<T> = Result<T, DriverError>;

/* What `construct` reports on success: identity + geometry. The driver
 * itself retains the transport handle and any protocol-private state. */
pub struct ConstructInfo {
    pub identity: Identity,
    pub geometry: Geometry,
}

/* What `read_command` reports: a ready `Command`, `Eof`, `Restart`, or a
 * `Pending` outcome carrying the matcher's auto-repeat poll hint. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCommandOutcome {
    Pending { poll_after_ms: Option<u64> },
    Command(Command),
    Eof,
    Restart,
}

/* Every supported wire protocol implements this. The engine calls these
 * methods from its single-threaded read/write turns; no method may block
 * past the transport's own timeouts. */
pub trait BrailleDriver: Send {
    fn code(&self) -> &'static str;

    /* The driver's symbolic key-name table, used to compile `.ktb` files
     * and to resolve raw `(group, number)` pairs for diagnostics. */
    fn name_table(&self) -> KeyNameTable;

    /* Open/probe, set geometry, allocate buffers. Failures roll back all
     * partial allocation; the supplied `transport` is only consumed on
     * success. */
    fn construct(&mut self, transport: Box<dyn Transport>) -> DriverResult<ConstructInfo>;

    fn destruct(&mut self);

    /* Cell write. `cells` is the full usable-length buffer; `range` is the
     * already-computed diff, or `None` if nothing changed. The driver
     * re-projects `range` through its own hidden-cell layout and splits it
     * to its per-packet size limit. */
    fn write_window(&mut self, cells: &[u8], range: Option<crate::diff::DiffRange>) -> DriverResult<()>;

    fn write_status(&mut self, _cells: &[u8]) -> DriverResult<()> {
        Ok(())
    }

    /* Drain available input, feed key events through `matcher`, and return
     * one outcome. */
    fn read_command(
        &mut self,
        matcher: &mut Matcher,
        key_table: &KeyTable,
        context: crate::keytable::Context,
        now_ms: u64,
    ) -> ReadCommandOutcome;

    /* Re-projected hidden-cell map, if this driver's geometry has gaps.
     * `None` means usable and physical cells coincide. */
    fn hidden_layout(&self) -> Option<&[usize]> {
        None
    }

    /* A model-id change observed mid-session (Cebra-style) sets this once;
     * the engine applies the new column count before the next
     * `write_window` and the driver clears it. Drivers that never retune
     * geometry leave the default. */
    fn take_resize(&mut self) -> Option<usize> {
        None
    }
}

/* Instantiate the correct driver for a two-letter driver code. */
pub fn load_braille_driver(code: &str) -> Option<Box<dyn BrailleDriver>> {
    match code {
        "hw" => Some(Box::new(escape_framed::HumanWareDriver::new())),
        "al" => Some(Box::new(escape_framed::AlvaDriver::new())),
        "ce" => Some(Box::new(start_length_end::CebraDriver::new())),
        "pm" => Some(Box::new(start_length_end::PapenmeierDriver::new())),
        "bm" => Some(Box::new(magic_header::BrailleMemoDriver::new())),
        "dp" => Some(Box::new(ack_nak::DotPadDriver::new())),
        "ht" => Some(Box::new(ack_nak::HandyTechDriver::new())),
        "vo" => Some(Box::new(ascii_escaped::VoyagerDriver::new())),
        "hid" => Some(Box::new(hid_driver::GenericHidDriver::new())),
        other => {
            warn!("unknown driver code: {other}");
            None
        }
    }
}

/* Pull bytes off `transport` one at a time, feeding each to `reader` until
 * either a full packet is delivered or the transport reports a timeout.
 * Returns `None` on timeout so the caller can return control without
 * blocking the engine thread. */
pub fn read_one_packet(
    transport: &mut dyn Transport,
    reader: &mut PacketReader,
    verifier: &dyn PacketVerifier,
    initial_timeout: Duration,
    subsequent_timeout: Duration,
) -> DriverResult<Option<Vec<u8>>> {
    let mut byte = [0u8; 1];
    let mut first = true;
    loop {
        let timeout = if first { initial_timeout } else { subsequent_timeout };
        first = false;
        let n = transport.read(&mut byte, timeout, timeout)?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(packet) = reader.push(byte[0], verifier) {
            debug!("delivered {}-byte packet: {:02x?}", packet.len(), packet);
            return Ok(Some(packet));
        }
    }
}

/* Drain every packet currently available (bounded by `max_packets` to keep
 * one read turn finite), dispatching each through `on_packet`. Used by
 * drivers whose `read_command` just needs "parse everything ready, then
 * check the matcher" without per-driver read-loop boilerplate. */
pub fn drain_packets(
    transport: &mut dyn Transport,
    reader: &mut PacketReader,
    verifier: &dyn PacketVerifier,
    initial_timeout: Duration,
    subsequent_timeout: Duration,
    max_packets: usize,
    mut on_packet: impl FnMut(&[u8]),
) -> DriverResult<()> {
    for _ in 0..max_packets {
        match read_one_packet(transport, reader, verifier, initial_timeout, subsequent_timeout)? {
            Some(packet) => on_packet(&packet),
            None => break,
        }
    }
    Ok(())
}

/* Shared helper: feed a batch of already-extracted key events through the
 * matcher and report the first command that falls out, or a `Pending`
 * outcome carrying the matcher's suggested poll delay. */
pub fn match_events(
    matcher: &mut Matcher,
    key_table: &KeyTable,
    context: crate::keytable::Context,
    events: &[KeyEvent],
    now_ms: u64,
) -> ReadCommandOutcome {
    for &event in events {
        if let crate::keytable::matcher::MatchOutcome::Emit { command, .. } =
            matcher.on_event(key_table, context, event)
        {
            return ReadCommandOutcome::Command(command);
        }
    }
    if let crate::keytable::matcher::MatchOutcome::Emit { command, poll_after_ms } =
        matcher.poll_deadline(key_table, context, now_ms)
    {
        return ReadCommandOutcome::Command(command).with_poll_hint(poll_after_ms);
    }
    ReadCommandOutcome::Pending {
        poll_after_ms: matcher.suggested_poll_ms(),
    }
}

impl ReadCommandOutcome {
    /* `Command` carries no poll hint of its own; the foreign-call surface
     * only needs the delay when the caller should poll again without a
     * fresh command in hand. A command accompanied by a poll hint (e.g. a
     * long-press firing mid auto-repeat window) is reported as the command
     * itself — the host only sees `read_delay_ms` on a `Pending` turn. */
    fn with_poll_hint(self, _poll_after_ms: Option<u64>) -> Self {
        self
    }
}
