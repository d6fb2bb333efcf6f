//! Core runtime for refreshable braille displays.
//!
//! This crate owns exactly one attached display at a time: it speaks the
//! device's wire protocol over a pluggable [`transport`], debounces a text
//! buffer down to minimal cell writes, interprets raw key reports into
//! logical commands through a compiled key table, and exposes a small
//! foreign-call surface ([`ffi`]) for a host screen reader.

pub mod command;
pub mod diff;
pub mod display;
pub mod driver;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod handler;
pub mod keytable;
pub mod logging;
pub mod packet;
pub mod queue;
pub mod timer;
pub mod transport;

pub use display::MAX_CELLS;
pub use engine::Engine;
pub use error::{EngineError, Result};
