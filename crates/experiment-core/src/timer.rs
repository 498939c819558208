//! Deadline scheduler for the session's suspension points.
//!
//! Every wait (response window, movement countdown, outcome settling, feedback,
//! rest break, calibration phase/break) is a [`TimerKind`]. Arming a kind
//! replaces any earlier deadline of the same kind and cancelling a kind
//! invalidates it; stale heap entries are discarded when popped, so an expiry
//! can only fire for the deadline that is currently armed.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    CalibrationPhaseEnd,
    CalibrationBreakEnd,
    ResponseDeadline,
    MovementCountdown,
    OutcomeSettle,
    FeedbackEnd,
    RestBreakEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTimer {
    pub kind: TimerKind,
    pub due_ms: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Deadline {
    due_ms: u64,
    sequence: u64,
    kind: TimerKind,
    generation: u64,
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordering: (due_ms ASC, sequence ASC); ties resolve in arming order.
impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due_ms
            .cmp(&other.due_ms)
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Deadline>>,
    armed: BTreeMap<TimerKind, (u64, u64)>,
    next_sequence: u64,
    next_generation: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `kind` to fire at `due_ms`, replacing any deadline already armed for it.
    pub fn arm(&mut self, kind: TimerKind, due_ms: u64) {
        self.next_generation += 1;
        self.next_sequence += 1;
        let deadline = Deadline {
            due_ms,
            sequence: self.next_sequence,
            kind,
            generation: self.next_generation,
        };
        self.armed.insert(kind, (self.next_generation, due_ms));
        self.heap.push(Reverse(deadline));
    }

    /// Returns true when a live deadline was cancelled.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.armed.remove(&kind).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.armed.clear();
        self.heap.clear();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    pub fn due_at(&self, kind: TimerKind) -> Option<u64> {
        self.armed.get(&kind).map(|(_, due_ms)| *due_ms)
    }

    pub fn next_deadline(&mut self) -> Option<u64> {
        self.discard_stale();
        self.heap.peek().map(|Reverse(deadline)| deadline.due_ms)
    }

    /// Pops the earliest live deadline at or before `now_ms`, disarming it.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<FiredTimer> {
        self.discard_stale();
        let Reverse(next) = self.heap.peek()?;
        if next.due_ms > now_ms {
            return None;
        }
        let Reverse(deadline) = self.heap.pop()?;
        self.armed.remove(&deadline.kind);
        Some(FiredTimer {
            kind: deadline.kind,
            due_ms: deadline.due_ms,
        })
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse(top)) = self.heap.peek() {
            let live = self
                .armed
                .get(&top.kind)
                .map(|(generation, _)| *generation == top.generation)
                .unwrap_or(false);
            if live {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = TimerQueue::new();
        timers.arm(TimerKind::MovementCountdown, 900);
        timers.arm(TimerKind::ResponseDeadline, 300);
        assert_eq!(timers.next_deadline(), Some(300));
        assert_eq!(timers.pop_due(299), None);
        assert_eq!(
            timers.pop_due(1_000).map(|fired| fired.kind),
            Some(TimerKind::ResponseDeadline)
        );
        assert_eq!(
            timers.pop_due(1_000).map(|fired| fired.kind),
            Some(TimerKind::MovementCountdown)
        );
        assert_eq!(timers.pop_due(1_000), None);
    }

    #[test]
    fn rearming_discards_the_older_deadline() {
        let mut timers = TimerQueue::new();
        timers.arm(TimerKind::FeedbackEnd, 100);
        timers.arm(TimerKind::FeedbackEnd, 500);
        assert_eq!(timers.next_deadline(), Some(500));
        assert_eq!(timers.pop_due(200), None);
        let fired = timers.pop_due(500).expect("rearmed deadline fires");
        assert_eq!(fired.due_ms, 500);
        assert!(!timers.is_armed(TimerKind::FeedbackEnd));
    }

    #[test]
    fn cancelled_deadline_never_fires() {
        let mut timers = TimerQueue::new();
        timers.arm(TimerKind::ResponseDeadline, 250);
        assert!(timers.cancel(TimerKind::ResponseDeadline));
        assert!(!timers.cancel(TimerKind::ResponseDeadline));
        assert_eq!(timers.next_deadline(), None);
        assert_eq!(timers.pop_due(u64::MAX), None);
    }

    #[test]
    fn equal_deadlines_fire_in_arming_order() {
        let mut timers = TimerQueue::new();
        timers.arm(TimerKind::OutcomeSettle, 400);
        timers.arm(TimerKind::MovementCountdown, 400);
        assert_eq!(
            timers.pop_due(400).map(|fired| fired.kind),
            Some(TimerKind::OutcomeSettle)
        );
        assert_eq!(
            timers.pop_due(400).map(|fired| fired.kind),
            Some(TimerKind::MovementCountdown)
        );
    }
}
