//! Per-lane timer queue.
//!
//! Owned by the worker global scope and driven by the lane loop between
//! jobs. Teardown stops every pending timer so a dying worker cannot fire
//! callbacks into a released context.

use std::time::{Duration, Instant};

use sable_engine::ScriptValue;

pub(crate) type TimerId = u64;

struct TimerEntry {
    id: TimerId,
    deadline: Instant,
    callback: ScriptValue,
}

/// Pending timers for one lane. Never shared across threads; the lane owns
/// it through the global scope.
pub(crate) struct TimerQueue {
    entries: Vec<TimerEntry>,
    next_id: TimerId,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    pub(crate) fn schedule(&mut self, callback: ScriptValue, delay: Duration) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(TimerEntry {
            id,
            deadline: Instant::now() + delay,
            callback,
        });
        id
    }

    /// Cancel a pending timer. Returns false for ids that already fired or
    /// never existed.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        before != self.entries.len()
    }

    /// Remove and return every timer due at `now`, earliest deadline first.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<(TimerId, ScriptValue)> {
        let mut due = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].deadline <= now {
                due.push(self.entries.swap_remove(index));
            } else {
                index += 1;
            }
        }
        due.sort_by_key(|entry| entry.deadline);
        due.into_iter()
            .map(|entry| (entry.id, entry.callback))
            .collect()
    }

    /// Delay until the next deadline: zero when overdue, `None` when idle.
    pub(crate) fn next_delay(&self, now: Instant) -> Option<Duration> {
        self.entries
            .iter()
            .map(|entry| entry.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Drop every pending timer. Returns how many were stopped.
    pub(crate) fn stop_all(&mut self) -> usize {
        let stopped = self.entries.len();
        self.entries.clear();
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback() -> ScriptValue {
        ScriptValue::new(())
    }

    #[test]
    fn test_take_due_returns_expired_timers_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let late = queue.schedule(callback(), Duration::from_millis(20));
        let soon = queue.schedule(callback(), Duration::from_millis(5));
        queue.schedule(callback(), Duration::from_secs(60));

        let due = queue.take_due(Instant::now() + Duration::from_millis(30));
        let ids: Vec<TimerId> = due.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![soon, late]);
        assert!(queue.next_delay(Instant::now()).is_some());
    }

    #[test]
    fn test_cancel_removes_pending_timer() {
        let mut queue = TimerQueue::new();
        let id = queue.schedule(callback(), Duration::from_secs(1));
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert!(queue.take_due(Instant::now() + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn test_next_delay_saturates_for_overdue_timers() {
        let mut queue = TimerQueue::new();
        assert!(queue.next_delay(Instant::now()).is_none());
        queue.schedule(callback(), Duration::from_millis(0));
        let delay = queue.next_delay(Instant::now() + Duration::from_secs(1)).unwrap();
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn test_stop_all_reports_count() {
        let mut queue = TimerQueue::new();
        queue.schedule(callback(), Duration::from_secs(1));
        queue.schedule(callback(), Duration::from_secs(2));
        assert_eq!(queue.stop_all(), 2);
        assert_eq!(queue.stop_all(), 0);
    }
}
