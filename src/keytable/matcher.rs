/* Combination matcher: resolves a stream of `KeyEvent`s against a compiled
 * `KeyTable` into a stream of logical commands, handling long-press arming
 * and auto-repeat scheduling. */
use crate::command::Command;

use super::{BindingFlags, Context, ImmediateMatch, KeyBinding, KeyId, KeyTable};

/* How long a combination must be held before its long-press command fires,
 * and the auto-repeat poll interval once a combination is armed. Exposed
 * as constants rather than configuration because the
 * source ties both to a single compiled-in default; a host that needs a
 * different long-press threshold can override it via
 * `Matcher::with_long_press_threshold_ms`. */
pub const LONG_PRESS_THRESHOLD_MS: u64 = 1000;
pub const AUTOREPEAT_INTERVAL_MS: u64 = 400;

/* What the matcher wants the driver's `read_command` to do next. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /* No command ready yet. */
    Pending,
    /* A command is ready to emit. `poll_after_ms` is `Some` when the
     * caller should schedule another read that soon (armed long-press or
     * mid-chord auto-repeat window), matching the foreign-call surface's
     * `read_delay_ms` output parameter. */
    Emit {
        command: Command,
        poll_after_ms: Option<u64>,
    },
}

#[derive(Default)]
struct Armed {
    binding_release: Option<usize>,
    binding_long_press: Option<usize>,
    deadline_ms: Option<u64>,
    long_press_fired: bool,
}

/// Transient per-display matcher state, scoped to one key table context.
pub struct Matcher {
    pressed_modifiers: Vec<KeyId>,
    immediate_key: Option<KeyId>,
    armed: Armed,
    long_press_threshold_ms: u64,
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            pressed_modifiers: Vec::new(),
            immediate_key: None,
            armed: Armed::default(),
            long_press_threshold_ms: LONG_PRESS_THRESHOLD_MS,
        }
    }

    pub fn with_long_press_threshold_ms(mut self, ms: u64) -> Self {
        self.long_press_threshold_ms = ms;
        self
    }

    fn all_keys_released(&self) -> bool {
        self.pressed_modifiers.is_empty() && self.immediate_key.is_none()
    }

    /* Find the best binding for the current held-key state: a more specific
     * match (immediate key held) beats a less specific one; among equally
     * specific matches, fewer modifier keys wins; ties fall back to table
     * order. */
    fn resolve<'a>(&self, bindings: &'a [KeyBinding]) -> Option<(usize, &'a KeyBinding)> {
        let mut best: Option<(usize, &KeyBinding)> = None;
        for (idx, binding) in bindings.iter().enumerate() {
            if binding.combination.modifiers != self.pressed_modifiers {
                continue;
            }
            if !binding.combination.immediate.matches(self.immediate_key) {
                continue;
            }

            let better = match best {
                None => true,
                Some((_, current)) => {
                    let candidate_specific = binding.combination.immediate.is_specific();
                    let current_specific = current.combination.immediate.is_specific();
                    if candidate_specific != current_specific {
                        candidate_specific
                    } else {
                        binding.combination.modifiers.len() < current.combination.modifiers.len()
                    }
                }
            };
            if better {
                best = Some((idx, binding));
            }
        }
        best
    }

    fn command_for(&self, binding: &KeyBinding) -> Command {
        if let ImmediateMatch::AnyInGroup(_) = binding.combination.immediate {
            let key_number = self.immediate_key.map(|k| k.number).unwrap_or(0);
            Command::new(
                binding.command.block().unwrap_or(crate::command::Block::Route),
                binding.command.flags(),
                key_number | (binding.command.arg() & crate::command::ROUTE_ARG_LONG_PRESS),
            )
        } else {
            binding.command
        }
    }

    /* Feed one key event in. `table`/`context` select the active binding
     * set; the event's own `timestamp_ms` drives the long-press deadline. */
    pub fn on_event(
        &mut self,
        table: &KeyTable,
        context: Context,
        event: super::KeyEvent,
    ) -> MatchOutcome {
        if event.pressed {
            if event.key.group == crate::keytable::Group::ROUTING
                || self.is_immediate_candidate(table, context, event.key)
            {
                self.immediate_key = Some(event.key);
            } else {
                if !self.pressed_modifiers.contains(&event.key) {
                    self.pressed_modifiers.push(event.key);
                    self.pressed_modifiers.sort();
                }
            }

            let bindings = table.context(context);
            if let Some((idx, binding)) = self.resolve(bindings) {
                self.armed.binding_release = Some(idx);
                if binding.is_long_press() {
                    self.armed.binding_long_press = Some(idx);
                    self.armed.deadline_ms = Some(event.timestamp_ms + self.long_press_threshold_ms);
                    self.armed.long_press_fired = false;
                    return MatchOutcome::Pending;
                }
            }
            MatchOutcome::Pending
        } else {
            self.pressed_modifiers.retain(|k| *k != event.key);
            if self.immediate_key == Some(event.key) {
                self.immediate_key = None;
            }

            if self.all_keys_released() {
                let outcome = if !self.armed.long_press_fired {
                    self.armed
                        .binding_release
                        .and_then(|idx| table.context(context).get(idx))
                        .map(|binding| MatchOutcome::Emit {
                            command: self.command_for(binding),
                            poll_after_ms: None,
                        })
                        .unwrap_or(MatchOutcome::Pending)
                } else {
                    MatchOutcome::Pending
                };
                self.clear_armed();
                outcome
            } else {
                MatchOutcome::Pending
            }
        }
    }

    /* Poll for an elapsed long-press deadline. Called by the driver's
     * `read_command` on a read timeout, faking the async auto-repeat
     * without a background timer thread. */
    pub fn poll_deadline(
        &mut self,
        table: &KeyTable,
        context: Context,
        now_ms: u64,
    ) -> MatchOutcome {
        let Some(deadline) = self.armed.deadline_ms else {
            return MatchOutcome::Pending;
        };
        if now_ms < deadline || self.all_keys_released() {
            return MatchOutcome::Pending;
        }
        if self.armed.long_press_fired {
            return MatchOutcome::Pending;
        }
        let Some(idx) = self.armed.binding_long_press else {
            return MatchOutcome::Pending;
        };
        let Some(binding) = table.context(context).get(idx) else {
            return MatchOutcome::Pending;
        };
        self.armed.long_press_fired = true;
        MatchOutcome::Emit {
            command: self.command_for(binding),
            poll_after_ms: Some(AUTOREPEAT_INTERVAL_MS / 2),
        }
    }

    /* Suggested poll delay while a combination is still forming or armed,
     * for the foreign-call surface's `read_delay_ms` out-parameter. */
    pub fn suggested_poll_ms(&self) -> Option<u64> {
        if self.armed.deadline_ms.is_some() && !self.armed.long_press_fired {
            Some(AUTOREPEAT_INTERVAL_MS / 2)
        } else {
            None
        }
    }

    fn clear_armed(&mut self) {
        self.armed = Armed::default();
    }

    /* A key counts as a candidate "immediate" trigger (rather than a held
     * modifier) if any binding in the active context names it as such.
     * Routing keys are always immediate by convention. */
    fn is_immediate_candidate(&self, table: &KeyTable, context: Context, key: KeyId) -> bool {
        table.context(context).iter().any(|b| match b.combination.immediate {
            ImmediateMatch::Specific(k) => k == key,
            ImmediateMatch::AnyInGroup(g) => g == key.group,
            ImmediateMatch::None => false,
        })
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keytable::{compiler, Group, KeyEvent, KeyId, KeyName, KeyNameTable};

    const NAMES: KeyNameTable = &[
        KeyName { name: "Dot1", key: KeyId { group: Group::DOT, number: 1 } },
        KeyName { name: "Dot2", key: KeyId { group: Group::DOT, number: 2 } },
        KeyName { name: "RoutingKey", key: KeyId { group: Group::ROUTING, number: 0 } },
    ];

    fn table_from(src: &str) -> KeyTable {
        let path = std::env::temp_dir().join(format!(
            "brl-engine-matcher-test-{:?}.ktb",
            std::thread::current().id()
        ));
        std::fs::write(&path, src).unwrap();
        let t = compiler::compile(&path, NAMES).unwrap();
        std::fs::remove_file(&path).ok();
        t
    }

    fn press(group: Group, number: u8, t: u64) -> KeyEvent {
        KeyEvent { key: KeyId::new(group, number), pressed: true, timestamp_ms: t }
    }
    fn release(group: Group, number: u8, t: u64) -> KeyEvent {
        KeyEvent { key: KeyId::new(group, number), pressed: false, timestamp_ms: t }
    }

    #[test]
    fn single_key_release_emits_command() {
        let table = table_from("bind Dot1 HOME\n");
        let mut m = Matcher::new();
        assert_eq!(m.on_event(&table, Context::Default, press(Group::DOT, 1, 0)), MatchOutcome::Pending);
        let out = m.on_event(&table, Context::Default, release(Group::DOT, 1, 10));
        match out {
            MatchOutcome::Emit { command, poll_after_ms } => {
                assert_eq!(command.block(), Some(crate::command::Block::Home));
                assert_eq!(poll_after_ms, None);
            }
            _ => panic!("expected emit"),
        }
    }

    #[test]
    fn long_press_and_release_are_mutually_exclusive() {
        let table = table_from("bind Dot1 HOME long_press\n");
        let mut m = Matcher::new().with_long_press_threshold_ms(100);
        m.on_event(&table, Context::Default, press(Group::DOT, 1, 0));
        let fired = m.poll_deadline(&table, Context::Default, 150);
        assert!(matches!(fired, MatchOutcome::Emit { .. }));
        let after_release = m.on_event(&table, Context::Default, release(Group::DOT, 1, 200));
        assert_eq!(after_release, MatchOutcome::Pending);
    }

    #[test]
    fn release_before_deadline_fires_release_not_long_press() {
        let table = table_from("bind Dot1 HOME long_press\n");
        let mut m = Matcher::new().with_long_press_threshold_ms(1000);
        m.on_event(&table, Context::Default, press(Group::DOT, 1, 0));
        let released = m.on_event(&table, Context::Default, release(Group::DOT, 1, 50));
        assert!(matches!(released, MatchOutcome::Emit { .. }));
        let late_poll = m.poll_deadline(&table, Context::Default, 2000);
        assert_eq!(late_poll, MatchOutcome::Pending);
    }

    #[test]
    fn chord_resolves_to_modifier_plus_immediate() {
        let table = table_from("bind Dot1+Dot2 FWINRT\n");
        let mut m = Matcher::new();
        m.on_event(&table, Context::Default, press(Group::DOT, 1, 0));
        m.on_event(&table, Context::Default, press(Group::DOT, 2, 1));
        m.on_event(&table, Context::Default, release(Group::DOT, 2, 2));
        let out = m.on_event(&table, Context::Default, release(Group::DOT, 1, 3));
        assert!(matches!(out, MatchOutcome::Emit { .. }));
    }

    #[test]
    fn routing_key_arg_is_key_number() {
        let table = table_from("bind RoutingKey ROUTE\n");
        let mut m = Matcher::new();
        m.on_event(&table, Context::Default, press(Group::ROUTING, 22, 0));
        let out = m.on_event(&table, Context::Default, release(Group::ROUTING, 22, 1));
        match out {
            MatchOutcome::Emit { command, .. } => assert_eq!(command.route_key_number(), 22),
            _ => panic!("expected emit"),
        }
    }

    #[test]
    fn deterministic_for_fixed_event_sequence() {
        let table = table_from("bind Dot1 HOME\nbind Dot2 FWINRT\n");
        let events = [press(Group::DOT, 1, 0), release(Group::DOT, 1, 5), press(Group::DOT, 2, 10), release(Group::DOT, 2, 15)];

        let run = || {
            let mut m = Matcher::new();
            let mut out = Vec::new();
            for e in events {
                if let MatchOutcome::Emit { command, .. } = m.on_event(&table, Context::Default, e) {
                    out.push(command);
                }
            }
            out
        };

        assert_eq!(run(), run());
    }
}
