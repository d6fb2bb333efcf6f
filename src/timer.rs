/* Monotonic clock and one-shot alarm abstraction. The engine runs
 * cooperatively on a single thread, so "scheduling" an alarm just
 * records a deadline; the caller's read loop compares it against `now_ms()`
 * at each turn instead of relying on a free-running timer thread. */
use std::time::Instant;

pub trait Clock {
    fn now_ms(&self) -> u64;
}

/* Default clock backed by `std::time::Instant`, monotonic and independent
 * of wall-clock adjustments. */
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/* A single pending deadline. The command queue keeps at most one of these
 * alive at a time. */
#[derive(Debug, Clone, Copy, Default)]
pub struct Alarm {
    deadline_ms: Option<u64>,
}

impl Alarm {
    pub fn schedule(&mut self, now_ms: u64, delay_ms: u64) {
        self.deadline_ms = Some(now_ms + delay_ms);
    }

    pub fn cancel(&mut self) {
        self.deadline_ms = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline_ms.is_some()
    }

    /* Returns true (and disarms) exactly once the deadline has passed. */
    pub fn fire_if_due(&mut self, now_ms: u64) -> bool {
        match self.deadline_ms {
            Some(deadline) if now_ms >= deadline => {
                self.deadline_ms = None;
                true
            }
            _ => false,
        }
    }
}
