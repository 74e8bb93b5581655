//! Deterministic event queue driving the pump's periodic ticks and one-shot
//! delayed work.
//!
//! Entries pop in `(due, rank, seq)` order: earliest first, ties broken by a
//! fixed per-task rank and then by insertion order. Periodic entries are
//! pushed back at `due + period` as they pop, so a slow dispatcher never
//! collapses several missed ticks into one.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    Glucose,
    Control,
    BolusStep { bolus_id: u64 },
    Iob,
    Reservoir,
    Battery,
    Charge,
    Reminder,
    Occlusion,
    Shutdown,
}

impl Task {
    /// Tie-break between tasks due at the same instant. A new reading is taken
    /// before the control loop looks at it.
    pub fn rank(self) -> u8 {
        match self {
            Task::Glucose => 0,
            Task::Control => 1,
            Task::BolusStep { .. } => 2,
            Task::Iob => 3,
            Task::Reservoir => 4,
            Task::Battery => 5,
            Task::Charge => 6,
            Task::Reminder => 7,
            Task::Occlusion => 8,
            Task::Shutdown => 9,
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::BolusStep { bolus_id } => write!(f, "BolusStep({})", bolus_id),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub due: DateTime<Utc>,
    pub task: Task,
    pub period: Option<Duration>,
    seq: u64,
}

impl Ord for Scheduled {
    // Reversed so the max-heap yields the earliest entry.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.task.rank().cmp(&self.task.rank()))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_at(&mut self, due: DateTime<Utc>, task: Task) {
        self.push(due, task, None);
    }

    /// Run `task` every `period`, first at `now + period`.
    pub fn schedule_every(&mut self, now: DateTime<Utc>, period: Duration, task: Task) {
        let period = period.max(Duration::milliseconds(1));
        self.push(now + period, task, Some(period));
    }

    fn push(&mut self, due: DateTime<Utc>, task: Task, period: Option<Duration>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled {
            due,
            task,
            period,
            seq,
        });
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|s| s.due)
    }

    /// Pop the earliest entry due at or before `until`, re-arming it if periodic.
    pub fn pop_due(&mut self, until: DateTime<Utc>) -> Option<Scheduled> {
        if self.heap.peek()?.due > until {
            return None;
        }
        let entry = self.heap.pop()?;
        if let Some(period) = entry.period {
            self.push(entry.due + period, entry.task, Some(period));
        }
        Some(entry)
    }

    /// Drop every entry matching `pred`.
    pub fn cancel(&mut self, pred: impl Fn(&Task) -> bool) {
        self.heap.retain(|s| !pred(&s.task));
    }

    pub fn contains(&self, task: Task) -> bool {
        self.heap.iter().any(|s| s.task == task)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Wall-clock interval for a tick whose period is given in simulated seconds.
pub fn scaled_period(simulated_secs: i64, speed_factor: u32) -> Duration {
    let millis = simulated_secs * 1000 / speed_factor.max(1) as i64;
    Duration::milliseconds(millis.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, VirtualClock};

    fn drain(queue: &mut EventQueue, until: DateTime<Utc>) -> Vec<(DateTime<Utc>, Task)> {
        let mut out = Vec::new();
        while let Some(s) = queue.pop_due(until) {
            out.push((s.due, s.task));
        }
        out
    }

    #[test]
    fn test_order_by_due_then_rank_then_seq() {
        let t0 = VirtualClock::at_epoch().now();
        let mut q = EventQueue::new();
        q.schedule_at(t0 + Duration::seconds(5), Task::Battery);
        q.schedule_at(t0 + Duration::seconds(5), Task::Glucose);
        q.schedule_at(t0 + Duration::seconds(1), Task::Shutdown);
        q.schedule_at(t0 + Duration::seconds(5), Task::BolusStep { bolus_id: 1 });
        q.schedule_at(t0 + Duration::seconds(5), Task::BolusStep { bolus_id: 2 });
        let order: Vec<Task> = drain(&mut q, t0 + Duration::seconds(10)).into_iter().map(|(_, t)| t).collect();
        assert_eq!(
            order,
            vec![
                Task::Shutdown,
                Task::Glucose,
                Task::BolusStep { bolus_id: 1 },
                Task::BolusStep { bolus_id: 2 },
                Task::Battery,
            ]
        );
    }

    #[test]
    fn test_periodic_rearms() {
        let t0 = VirtualClock::at_epoch().now();
        let mut q = EventQueue::new();
        q.schedule_every(t0, Duration::seconds(10), Task::Iob);
        let fired = drain(&mut q, t0 + Duration::seconds(35));
        assert_eq!(fired.len(), 3);
        assert_eq!(fired[2].0, t0 + Duration::seconds(30));
        assert_eq!(q.next_due(), Some(t0 + Duration::seconds(40)));
    }

    #[test]
    fn test_nothing_due_yet() {
        let t0 = VirtualClock::at_epoch().now();
        let mut q = EventQueue::new();
        q.schedule_at(t0 + Duration::seconds(2), Task::Charge);
        assert!(q.pop_due(t0).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_cancel_and_clear() {
        let t0 = VirtualClock::at_epoch().now();
        let mut q = EventQueue::new();
        q.schedule_every(t0, Duration::seconds(3), Task::Charge);
        q.schedule_every(t0, Duration::seconds(5), Task::Battery);
        q.cancel(|t| *t == Task::Charge);
        assert!(!q.contains(Task::Charge));
        assert!(q.contains(Task::Battery));
        q.clear();
        assert!(q.is_empty());
        assert!(q.pop_due(t0 + Duration::hours(1)).is_none());
    }

    #[test]
    fn test_scaled_period() {
        assert_eq!(scaled_period(300, 30), Duration::seconds(10));
        assert_eq!(scaled_period(5, 30), Duration::milliseconds(166));
        assert_eq!(scaled_period(300, 1), Duration::seconds(300));
    }
}
