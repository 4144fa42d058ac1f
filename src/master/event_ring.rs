//! Bounded FIFO log of the most recent worker events the master has seen.

use std::collections::VecDeque;

use crate::worker::WorkerEvent;

const CAPACITY: usize = 1000;

#[derive(Default)]
pub struct EventRing {
    events: VecDeque<WorkerEvent>,
}

impl EventRing {
    pub fn new() -> Self {
        Self { events: VecDeque::with_capacity(CAPACITY) }
    }

    /// Append-only; evicts the oldest entry once length exceeds capacity.
    pub fn push(&mut self, event: WorkerEvent) {
        self.events.push_back(event);
        if self.events.len() > CAPACITY {
            self.events.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Newest-first, optionally filtered to events strictly before `before`
    /// (by timestamp), capped at `limit`.
    pub fn query(&self, limit: usize, before: Option<chrono::DateTime<chrono::Utc>>) -> (Vec<&WorkerEvent>, bool, usize) {
        let matching: Vec<&WorkerEvent> = self
            .events
            .iter()
            .rev()
            .filter(|e| before.map(|b| e.timestamp < b).unwrap_or(true))
            .collect();
        let total = matching.len();
        let page: Vec<&WorkerEvent> = matching.into_iter().take(limit).collect();
        let has_more = total > page.len();
        (page, has_more, total)
    }

    pub fn recent(&self, n: usize) -> Vec<&WorkerEvent> {
        self.events.iter().rev().take(n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerEventType;

    fn event() -> WorkerEvent {
        WorkerEvent::new(WorkerEventType::Heartbeat, "w1")
    }

    #[test]
    fn evicts_oldest_past_1000() {
        let mut ring = EventRing::new();
        for _ in 0..1050 {
            ring.push(event());
        }
        assert_eq!(ring.len(), 1000);
    }

    #[test]
    fn query_defaults_to_newest_first() {
        let mut ring = EventRing::new();
        let mut e1 = event();
        e1.session_name = Some("a".into());
        let mut e2 = event();
        e2.session_name = Some("b".into());
        ring.push(e1);
        ring.push(e2);

        let (page, has_more, total) = ring.query(10, None);
        assert_eq!(total, 2);
        assert!(!has_more);
        assert_eq!(page[0].session_name.as_deref(), Some("b"));
    }
}
