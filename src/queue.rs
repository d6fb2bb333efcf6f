/* Command queue: a FIFO of packed commands with suspend/resume and a
 * single rearm-able alarm. */
use std::collections::VecDeque;

use crate::command::Command;
use crate::timer::Alarm;

#[derive(Default)]
pub struct CommandQueue {
    queue: VecDeque<Command>,
    /* Reentrancy-safe counter: >0 means suspended. The counter prevents
     * reentrant suspend races. */
    suspend_count: u32,
    alarm: Alarm,
    handling: bool,
}

/* Preferences that gate the pre-dispatch swap transformations. */
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchPreferences {
    pub skip_identical_lines: bool,
    pub skip_blank_windows: bool,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command, now_ms: u64) {
        self.queue.push_back(command);
        self.rearm(now_ms);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_count > 0
    }

    pub fn suspend(&mut self) {
        self.suspend_count += 1;
        self.alarm.cancel();
    }

    pub fn resume(&mut self, now_ms: u64) {
        self.suspend_count = self.suspend_count.saturating_sub(1);
        if self.suspend_count == 0 {
            self.rearm(now_ms);
        }
    }

    /* Rearm iff the queue has work, isn't suspended, and nothing is
     * currently being handled. */
    fn rearm(&mut self, now_ms: u64) {
        if !self.queue.is_empty() && !self.is_suspended() && !self.handling {
            self.alarm.schedule(now_ms, 0);
        }
    }

    /* Pop and apply the preference-driven swaps. Marks the queue as
     * "handling" until `finish_dispatch` is called, so a push from within
     * a handler doesn't rearm a racing alarm. */
    pub fn begin_dispatch(&mut self, prefs: DispatchPreferences) -> Option<Command> {
        if self.is_suspended() {
            return None;
        }
        let command = self.queue.pop_front()?;
        self.handling = true;
        let command = if prefs.skip_identical_lines {
            crate::command::swap_skip_identical_lines(command)
        } else {
            command
        };
        let command = if prefs.skip_blank_windows {
            crate::command::swap_skip_blank_windows(command)
        } else {
            command
        };
        Some(command)
    }

    pub fn finish_dispatch(&mut self, now_ms: u64) {
        self.handling = false;
        self.rearm(now_ms);
    }

    pub fn alarm_due(&mut self, now_ms: u64) -> bool {
        self.alarm.fire_if_due(now_ms)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
