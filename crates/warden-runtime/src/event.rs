//! Event types and the scheduled-event queue.
//!
//! Events reference containers by id so a destroyed container never
//! stays alive through the queue; delivery resolves the id and silently
//! drops events whose target is gone.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use warden_common::types::ContainerId;

/// One unit of work delivered into the holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A reaped child: pid plus raw wait status.
    Exit {
        /// Reaped pid.
        pid: i32,
        /// Raw status from `waitpid`.
        status: i32,
    },
    /// An armed OOM eventfd fired.
    Oom {
        /// Raw fd of the eventfd that became readable.
        fd: i32,
    },
    /// A dead container's respawn delay elapsed.
    Respawn(ContainerId),
    /// Periodic stdout/stderr size check.
    RotateLogs,
}

/// Timer heap ordering scheduled events by due time.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<Entry>>,
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    due: Instant,
    seq: u64,
    event: Event,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl EventQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules an event `delay` from now.
    pub fn add(&mut self, delay: Duration, event: Event) {
        self.add_at(Instant::now() + delay, event);
    }

    /// Schedules an event at an absolute instant.
    pub fn add_at(&mut self, due: Instant, event: Event) {
        static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.heap.push(Reverse(Entry { due, seq, event }));
    }

    /// Time until the earliest scheduled event, `None` when idle.
    ///
    /// An already-due event reports a zero timeout.
    #[must_use]
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|Reverse(entry)| entry.due.saturating_duration_since(now))
    }

    /// Pops every event due at or before `now`, in due order.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Event> {
        let mut expired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.due > now {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                expired.push(entry.event);
            }
        }
        expired
    }

    /// Number of scheduled events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True when nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_has_no_timeout() {
        let queue = EventQueue::new();
        assert_eq!(queue.next_timeout(Instant::now()), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn expired_events_come_out_in_due_order() {
        let mut queue = EventQueue::new();
        let now = Instant::now();
        queue.add_at(now + Duration::from_millis(20), Event::RotateLogs);
        queue.add_at(now + Duration::from_millis(10), Event::Respawn(ContainerId(3)));
        queue.add_at(
            now + Duration::from_millis(30),
            Event::Respawn(ContainerId(4)),
        );

        let expired = queue.take_expired(now + Duration::from_millis(25));
        assert_eq!(
            expired,
            vec![Event::Respawn(ContainerId(3)), Event::RotateLogs]
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn due_event_reports_zero_timeout() {
        let mut queue = EventQueue::new();
        let now = Instant::now();
        queue.add_at(now, Event::RotateLogs);
        assert_eq!(queue.next_timeout(now + Duration::from_secs(1)), Some(Duration::ZERO));
    }

    #[test]
    fn same_instant_preserves_insertion_order() {
        let mut queue = EventQueue::new();
        let now = Instant::now();
        queue.add_at(now, Event::Respawn(ContainerId(1)));
        queue.add_at(now, Event::Respawn(ContainerId(2)));
        queue.add_at(now, Event::Respawn(ContainerId(3)));
        let expired = queue.take_expired(now);
        assert_eq!(
            expired,
            vec![
                Event::Respawn(ContainerId(1)),
                Event::Respawn(ContainerId(2)),
                Event::Respawn(ContainerId(3)),
            ]
        );
    }

    #[test]
    fn future_events_stay_queued() {
        let mut queue = EventQueue::new();
        let now = Instant::now();
        queue.add_at(now + Duration::from_secs(5), Event::RotateLogs);
        assert!(queue.take_expired(now).is_empty());
        assert_eq!(queue.len(), 1);
        let timeout = queue.next_timeout(now).unwrap();
        assert!(timeout > Duration::from_secs(4));
    }
}
