//! Rate-limiting helper used to drive the session's rekey/dikey/cikey deadlines.

use crate::NEVER_HAPPENED_TICKS;

/// A single one-shot deadline (no fixed frequency), used for rekey timers whose next
/// firing time is computed explicitly rather than on a fixed period.
#[derive(Clone, Copy)]
pub struct Deadline(i64);

impl Default for Deadline {
    #[inline(always)]
    fn default() -> Self {
        Self(NEVER_HAPPENED_TICKS)
    }
}

impl Deadline {
    #[inline(always)]
    pub fn at(t: i64) -> Self {
        Self(t)
    }

    #[inline(always)]
    pub fn due(&self, now: i64) -> bool {
        self.0 != NEVER_HAPPENED_TICKS && now >= self.0
    }

    #[inline(always)]
    pub fn set(&mut self, t: i64) {
        self.0 = t;
    }

    #[inline(always)]
    pub fn get(&self) -> i64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_never_due_until_set() {
        let d = Deadline::default();
        assert!(!d.due(1_000_000));
    }
}
