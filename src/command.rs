/* Packed command encoding: block code (top byte), flag bits (middle two
 * bytes), argument (bottom byte). */

/* Block codes (top byte of a `Command`). Not exhaustive of every BRLTTY-
 * style command a real driver family would define, but covers every
 * command this crate's drivers and tests reference. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Block {
    NoCmd = 0x00,
    LnUp = 0x01,
    LnDn = 0x02,
    PrDifLn = 0x03,
    NxDifLn = 0x04,
    FWinLt = 0x05,
    FWinRt = 0x06,
    FWinLtSkip = 0x07,
    FWinRtSkip = 0x08,
    Route = 0x09,
    Home = 0x0A,
    Restart = 0x0B,
}

impl Block {
    fn from_u8(v: u8) -> Option<Self> {
        use Block::*;
        Some(match v {
            0x00 => NoCmd,
            0x01 => LnUp,
            0x02 => LnDn,
            0x03 => PrDifLn,
            0x04 => NxDifLn,
            0x05 => FWinLt,
            0x06 => FWinRt,
            0x07 => FWinLtSkip,
            0x08 => FWinRtSkip,
            0x09 => Route,
            0x0A => Home,
            0x0B => Restart,
            _ => return None,
        })
    }
}

/* Flag bits, packed into the two middle bytes of a `Command`. */
pub const FLG_TOGGLE_ON: u32 = 1 << 16;
pub const FLG_TOGGLE_OFF: u32 = 1 << 17;
pub const FLG_MOTION_TOLEFT: u32 = 1 << 18;
pub const FLG_LONG_PRESS: u32 = 1 << 19;

/* The argument-byte long-press bit reserved for `ROUTE`: a single bit
 * (0x80) in the argument byte of the ROUTE command. This is distinct from
 * `FLG_LONG_PRESS`, which applies to every other block. */
pub const ROUTE_ARG_LONG_PRESS: u8 = 0x80;

/* A packed 32-bit command: `block:8 | flags:16 | arg:8`. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command(pub u32);

impl Command {
    pub fn new(block: Block, flags: u32, arg: u8) -> Self {
        Command(((block as u32) << 24) | (flags & 0x00FF_FF00) | arg as u32)
    }

    pub fn block(self) -> Option<Block> {
        Block::from_u8((self.0 >> 24) as u8)
    }

    pub fn raw_block(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn flags(self) -> u32 {
        self.0 & 0x00FF_FF00
    }

    pub fn arg(self) -> u8 {
        self.0 as u8
    }

    pub fn with_flag(self, flag: u32) -> Self {
        Command(self.0 | flag)
    }

    pub fn has_flag(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    /* Route commands pack their long-press bit into the argument byte
     * itself rather than into the shared flag bytes, because the argument
     * is the routing-key index and must stay in `0..=0x7F`. */
    pub fn route(key_number: u8, long_press: bool) -> Self {
        debug_assert!(key_number <= 0x7F, "routing arg must fit in 7 bits");
        let arg = key_number | if long_press { ROUTE_ARG_LONG_PRESS } else { 0 };
        Command::new(Block::Route, 0, arg)
    }

    pub fn is_route(self) -> bool {
        self.raw_block() == Block::Route as u8
    }

    pub fn route_is_long_press(self) -> bool {
        self.is_route() && self.arg() & ROUTE_ARG_LONG_PRESS != 0
    }

    pub fn route_key_number(self) -> u8 {
        self.arg() & !ROUTE_ARG_LONG_PRESS
    }
}

pub const NO_COMMAND: i32 = -1;
pub const RESTART: i32 = -2;
pub const EOF: i32 = -3;

/* Swap pairs applied before dispatch under user preferences. Each swap is
 * independent and reversible; the queue never applies more than one swap
 * to the same command. */
pub fn swap_skip_identical_lines(cmd: Command) -> Command {
    match cmd.block() {
        Some(Block::LnUp) => Command::new(Block::PrDifLn, cmd.flags(), cmd.arg()),
        Some(Block::PrDifLn) => Command::new(Block::LnUp, cmd.flags(), cmd.arg()),
        Some(Block::LnDn) => Command::new(Block::NxDifLn, cmd.flags(), cmd.arg()),
        Some(Block::NxDifLn) => Command::new(Block::LnDn, cmd.flags(), cmd.arg()),
        _ => cmd,
    }
}

pub fn swap_skip_blank_windows(cmd: Command) -> Command {
    match cmd.block() {
        Some(Block::FWinLt) => Command::new(Block::FWinLtSkip, cmd.flags(), cmd.arg()),
        Some(Block::FWinLtSkip) => Command::new(Block::FWinLt, cmd.flags(), cmd.arg()),
        Some(Block::FWinRt) => Command::new(Block::FWinRtSkip, cmd.flags(), cmd.arg()),
        Some(Block::FWinRtSkip) => Command::new(Block::FWinRt, cmd.flags(), cmd.arg()),
        _ => cmd,
    }
}
