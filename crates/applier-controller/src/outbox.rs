//! Bounded holding area for terminal job reports
//!
//! `job_completed` and `job_failed` must reach the job source exactly once.
//! When the transport is down they wait here and are flushed in order right
//! after the next successful open.

use applier_core::{ClientMessage, Result};
use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ResultOutbox {
    capacity: usize,
    pending: VecDeque<ClientMessage>,
}

impl ResultOutbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: VecDeque::new(),
        }
    }

    /// Keep `message` for the next flush, evicting the oldest entry when full.
    ///
    /// Returns the evicted message, if any.
    pub fn push(&mut self, message: ClientMessage) -> Option<ClientMessage> {
        let evicted = if self.pending.len() >= self.capacity {
            let oldest = self.pending.pop_front();
            if let Some(oldest) = &oldest {
                warn!("Result outbox full, dropping {} ({:?})", oldest.kind(), oldest);
            }
            oldest
        } else {
            None
        };
        self.pending.push_back(message);
        evicted
    }

    /// Send pending messages in order until one fails.
    ///
    /// The failed message and everything after it stay queued. Returns the
    /// number of messages sent.
    pub fn flush<F>(&mut self, mut send: F) -> usize
    where
        F: FnMut(&ClientMessage) -> Result<()>,
    {
        let mut sent = 0;
        while let Some(message) = self.pending.front() {
            if let Err(e) = send(message) {
                debug!("Outbox flush stopped after {} messages: {}", sent, e);
                break;
            }
            self.pending.pop_front();
            sent += 1;
        }
        sent
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forget everything still pending
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
