// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-assignment event channels with a terminal-event latch.
//!
//! Events fan out to live SSE subscribers via a broadcast channel. The
//! terminal event (`done` or `error`) is additionally latched so a late
//! subscriber — one that attaches after the task finished — receives the
//! terminal event exactly once instead of an empty stream.

use std::sync::Mutex;
use tokio::sync::broadcast;

use awcp_core::event::TaskEvent;

/// Broadcast capacity per assignment; SSE consumers drain quickly and a
/// task emits a handful of events, so a small buffer suffices.
const CHANNEL_CAPACITY: usize = 64;

/// What a new subscriber gets back.
pub enum Subscription {
    /// The assignment already finished; replay this terminal event once.
    Replay(TaskEvent),
    /// Live subscription to future events.
    Live(broadcast::Receiver<TaskEvent>),
}

/// Ordered event fan-out for one assignment.
pub struct EventChannel {
    tx: broadcast::Sender<TaskEvent>,
    terminal: Mutex<Option<TaskEvent>>,
}

impl EventChannel {
    /// Create a channel with no subscribers and no latched terminal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            terminal: Mutex::new(None),
        }
    }

    /// Emit an event to all current subscribers.
    ///
    /// The first terminal event is latched; any terminal event after the
    /// first is dropped so the stream ends exactly once.
    pub fn emit(&self, event: TaskEvent) {
        if event.is_terminal() {
            let mut latch = self
                .terminal
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if latch.is_some() {
                return;
            }
            *latch = Some(event.clone());
        }
        // No subscribers is fine; the latch covers late arrivals.
        let _ = self.tx.send(event);
    }

    /// Subscribe; late subscribers get the latched terminal event.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let latch = self
            .terminal
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match latch.as_ref() {
            Some(event) => Subscription::Replay(event.clone()),
            None => Subscription::Live(self.tx.subscribe()),
        }
    }

    /// The latched terminal event, if the assignment has finished.
    #[must_use]
    pub fn terminal(&self) -> Option<TaskEvent> {
        self.terminal
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}
