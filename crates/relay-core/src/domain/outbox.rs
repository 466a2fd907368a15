//! Send-side outbox: numbers prompts and keeps them until acknowledged.
//!
//! The phone may lose its connection at any moment.  Every prompt it sends
//! stays in the outbox until the desktop acknowledges it (cumulatively), so
//! that after a reconnect the unacknowledged tail can be sent again.  The
//! desktop drops any copy it already delivered, which turns at-least-once on
//! the wire into exactly-once at the consumer.

use std::collections::VecDeque;

use thiserror::Error;

use crate::protocol::sequence::SequenceCounter;

/// Errors returned by [`Outbox`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutboxError {
    /// Too many prompts are waiting for acknowledgement.
    #[error("outbox full: {0} prompts awaiting acknowledgement")]
    Full(usize),
}

/// Prompts sent but not yet acknowledged, oldest first.
#[derive(Debug)]
pub struct Outbox {
    counter: SequenceCounter,
    unacked: VecDeque<(u64, String)>,
    acked_through: u64,
    capacity: usize,
}

impl Outbox {
    /// Creates an empty outbox whose first prompt will be numbered 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            counter: SequenceCounter::new(),
            unacked: VecDeque::new(),
            acked_through: 0,
            capacity: capacity.max(1),
        }
    }

    /// Numbers `text` and stores it until acknowledged.  Returns its sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Full`] when `capacity` prompts are already
    /// awaiting acknowledgement.  Nothing is numbered in that case.
    pub fn push(&mut self, text: impl Into<String>) -> Result<u64, OutboxError> {
        if self.unacked.len() >= self.capacity {
            return Err(OutboxError::Full(self.unacked.len()));
        }
        let seq = self.counter.next();
        self.unacked.push_back((seq, text.into()));
        Ok(seq)
    }

    /// Applies a cumulative acknowledgement.  Returns how many prompts were released.
    ///
    /// Stale acknowledgements (at or below the current mark) are ignored.
    pub fn ack_through(&mut self, seq: u64) -> usize {
        if seq <= self.acked_through {
            return 0;
        }
        self.acked_through = seq;
        let before = self.unacked.len();
        while matches!(self.unacked.front(), Some((s, _)) if *s <= seq) {
            self.unacked.pop_front();
        }
        before - self.unacked.len()
    }

    /// Highest acknowledged sequence number; 0 if none.
    pub fn acked_through(&self) -> u64 {
        self.acked_through
    }

    /// Highest sequence number handed out; 0 if none.
    pub fn last_sent(&self) -> u64 {
        self.counter.last_issued()
    }

    /// Prompts still awaiting acknowledgement, oldest first.
    pub fn unacked(&self) -> impl Iterator<Item = (u64, &str)> {
        self.unacked.iter().map(|(seq, text)| (*seq, text.as_str()))
    }

    pub fn len(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unacked.is_empty()
    }
}
