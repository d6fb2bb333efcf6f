/* Key table: compiled key-binding data plus the transient matcher state that
 * resolves raw key events into logical commands. Compiler lives in
 * `compiler`, resolution logic in `matcher`; this module owns the shared
 * data types both sides agree on. */
pub mod compiler;
pub mod matcher;

use std::collections::HashMap;

use thiserror::Error;

use crate::command::Command;

#[derive(Debug, Error)]
pub enum KeyTableError {
    #[error("{path}:{line}: {message}")]
    Syntax {
        path: String,
        line: usize,
        message: String,
    },

    #[error("unknown key name {0:?}")]
    UnknownKey(String),

    #[error("failed to read key table file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/* A coarse partition of a device's physical keys. Numbers within a group
 * are driver-local; the matcher never compares numbers across groups. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Group(pub u8);

impl Group {
    pub const NAVIGATION: Group = Group(0);
    pub const ROUTING: Group = Group(1);
    pub const DOT: Group = Group(2);
    pub const STATUS: Group = Group(3);
}

/* One physical key, identified by (group, driver-local number). Sorts by
 * group first, then number, which is the order the compiled key-name table
 * and every sorted-modifier-set use. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyId {
    pub group: Group,
    pub number: u8,
}

impl KeyId {
    pub fn new(group: Group, number: u8) -> Self {
        Self { group, number }
    }
}

/* A raw key event delivered by a driver's dispatch table. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: KeyId,
    pub pressed: bool,
    pub timestamp_ms: u64,
}

/* A symbolic key name as declared by a driver, resolved once at compile
 * time against the `.ktb` source; never looked up again afterwards. */
#[derive(Debug, Clone, Copy)]
pub struct KeyName {
    pub name: &'static str,
    pub key: KeyId,
}

/* Sorted-by-`(group, number)` key name table, binary-searched by the
 * compiler. Drivers build this once as a `&'static [KeyName]`. */
pub type KeyNameTable = &'static [KeyName];

pub fn find_key_number(table: KeyNameTable, group: Group, number: u8) -> Option<&'static str> {
    table
        .binary_search_by_key(&(group, number), |k| (k.key.group, k.key.number))
        .ok()
        .map(|i| table[i].name)
}

pub fn find_key_name(table: KeyNameTable, name: &str) -> Option<KeyId> {
    table.iter().find(|k| k.name == name).map(|k| k.key)
}

/* What a binding's "immediate" slot requires to match. Routing bindings use
 * `AnyInGroup` so one binding covers every routing key; the matched key's
 * number becomes the command's argument. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmediateMatch {
    None,
    Specific(KeyId),
    AnyInGroup(Group),
}

impl ImmediateMatch {
    pub fn matches(self, key: Option<KeyId>) -> bool {
        match (self, key) {
            (ImmediateMatch::None, None) => true,
            (ImmediateMatch::None, Some(_)) => false,
            (ImmediateMatch::Specific(a), Some(b)) => a == b,
            (ImmediateMatch::Specific(_), None) => false,
            (ImmediateMatch::AnyInGroup(g), Some(k)) => k.group == g,
            (ImmediateMatch::AnyInGroup(_), None) => false,
        }
    }

    pub fn is_specific(self) -> bool {
        !matches!(self, ImmediateMatch::None)
    }
}

/* A combination: a set of simultaneously-held modifier keys plus at most
 * one immediate key. Two combinations compare equal iff their sorted
 * modifier sets and immediate match both agree. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Combination {
    /* Sorted for equality/comparison. */
    pub modifiers: Vec<KeyId>,
    /* Parallel vector recording the order the modifiers were declared in
     * the source `.ktb` file, kept only for diagnostics/`list_key_map`. */
    pub modifiers_original_order: Vec<KeyId>,
    pub immediate: ImmediateMatch,
}

impl Combination {
    pub fn new(mut modifiers: Vec<KeyId>, immediate: ImmediateMatch) -> Self {
        let original = modifiers.clone();
        modifiers.sort();
        modifiers.dedup();
        Self {
            modifiers,
            modifiers_original_order: original,
            immediate,
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BindingFlags: u32 {
        const HIDDEN           = 0b0001;
        const LONG_PRESS       = 0b0010;
        const UNIFIED          = 0b0100;
        const IMMEDIATE        = 0b1000;
        /* Set on bindings synthesized by the compiler (routing long-press
         * augmentation); never present in a hand-written `.ktb` file. */
        const SYNTHETIC        = 0b1_0000;
    }
}

/* A compiled key binding: one combination, one command, and its flags. The
 * invariant that a combination with the immediate-flag set cannot also
 * carry a long-press flag is enforced by the compiler, not re-checked
 * here. */
#[derive(Debug, Clone)]
pub struct KeyBinding {
    pub combination: Combination,
    pub command: Command,
    pub flags: BindingFlags,
    pub key_names: Vec<&'static str>,
}

impl KeyBinding {
    pub fn is_long_press(&self) -> bool {
        self.flags.contains(BindingFlags::LONG_PRESS)
    }

    pub fn is_hidden(&self) -> bool {
        self.flags.contains(BindingFlags::HIDDEN)
    }
}

/* Which binding set is active. The matcher only ever scans one context's
 * bindings at a time. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Context {
    Default,
    Menu,
    Editing,
    Chords,
    Waiting,
}

/* A fully compiled, read-only key table: the driver's key-name table plus
 * one binding list per context. Immutable once compiled. */
#[derive(Debug, Clone)]
pub struct KeyTable {
    pub bindings: HashMap<Context, Vec<KeyBinding>>,
}

impl KeyTable {
    pub fn context(&self, ctx: Context) -> &[KeyBinding] {
        self.bindings
            .get(&ctx)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
