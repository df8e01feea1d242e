// src/events/inbox.rs
//! Lock-free event inbox
//!
//! The host pushes events for an agent from the scheduler thread; the agent's
//! primary thread drains them at its next turn hand-off. Bounded, so a
//! non-critical event is refused when the inbox is full. Critical events are
//! forced in, evicting the oldest entry.

use crate::events::event::Event;
use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct EventInbox {
    queue: ArrayQueue<Event>,

    push_count: AtomicU64,

    pop_count: AtomicU64,

    /// Events refused or evicted because the inbox was full
    drop_count: AtomicU64,
}

impl EventInbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Push an event. On a full inbox a non-critical event is handed back.
    pub fn push(&self, event: Event) -> Result<(), Event> {
        if event.is_critical() {
            if self.queue.force_push(event).is_some() {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
            }
            self.push_count.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        match self.queue.push(event) {
            Ok(()) => {
                self.push_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(event) => {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                Err(event)
            }
        }
    }

    pub fn try_pop(&self) -> Option<Event> {
        let event = self.queue.pop()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Take everything currently queued
    pub fn drain(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.queue.len());
        while let Some(event) = self.try_pop() {
            events.push(event);
        }
        events
    }

    pub fn stats(&self) -> InboxStats {
        InboxStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Inbox statistics
#[derive(Debug, Clone, Serialize)]
pub struct InboxStats {
    pub push_count: u64,
    pub pop_count: u64,
    pub drop_count: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl InboxStats {
    pub fn drop_rate(&self) -> f64 {
        let offered = self.push_count + self.drop_count;
        if offered == 0 {
            0.0
        } else {
            (self.drop_count as f64 / offered as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event::EventKind;
    use serde_json::json;
    use std::sync::Arc;

    fn event(kind: EventKind, sequence: u64) -> Event {
        Event::new(kind, 1, sequence, json!({}))
    }

    #[test]
    fn test_push_drain() {
        let inbox = EventInbox::new(4);
        inbox.push(event(EventKind::Status, 1)).unwrap();
        inbox.push(event(EventKind::Scanned, 2)).unwrap();

        let drained = inbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].sequence(), 1);
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_full_refuses_game_event() {
        let inbox = EventInbox::new(2);
        inbox.push(event(EventKind::Status, 1)).unwrap();
        inbox.push(event(EventKind::Status, 2)).unwrap();

        let refused = inbox.push(event(EventKind::Scanned, 3));
        assert!(refused.is_err());
        assert_eq!(inbox.stats().drop_count, 1);
    }

    #[test]
    fn test_full_accepts_critical_event() {
        let inbox = EventInbox::new(2);
        inbox.push(event(EventKind::Status, 1)).unwrap();
        inbox.push(event(EventKind::Status, 2)).unwrap();

        inbox.push(event(EventKind::Death, 3)).unwrap();
        let drained = inbox.drain();
        assert!(drained.iter().any(|e| e.kind() == &EventKind::Death));
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn test_stats() {
        let inbox = EventInbox::new(10);
        inbox.push(event(EventKind::Status, 1)).unwrap();
        inbox.push(event(EventKind::Status, 2)).unwrap();
        inbox.try_pop();

        let stats = inbox.stats();
        assert_eq!(stats.push_count, 2);
        assert_eq!(stats.pop_count, 1);
        assert_eq!(stats.current_size, 1);
        assert_eq!(stats.drop_rate(), 0.0);
    }

    #[test]
    fn test_concurrent_producers() {
        use std::thread;

        let inbox = Arc::new(EventInbox::new(1000));
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let inbox = Arc::clone(&inbox);
                thread::spawn(move || {
                    for j in 0..100 {
                        let _ = inbox.push(event(EventKind::Status, i * 100 + j));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(inbox.len(), 1000);
    }
}
