//! Receive-side reorder buffer.
//!
//! The desktop must hand prompts to the consumer in strictly increasing
//! sequence order, exactly once, even when frames arrive out of order or are
//! retransmitted after a reconnect.  [`ReorderBuffer`] holds the delivery
//! high-water mark plus any frames that arrived ahead of a gap.
//!
//! ```text
//! delivered_through = 3        pending = {5: "…", 6: "…"}
//!            ▲                            ▲
//!   everything ≤ 3 was handed off    waiting for 4
//! ```
//!
//! A gap is never waited on forever.  It is declared a permanent loss when
//! either the buffer holds more than `max_pending` frames or the gap has been
//! open for `gap_timeout`.  The missing range is then reported as a
//! [`Delivery::Dropped`] and delivery continues from the next buffered frame.
//!
//! A frame more than `window` ahead of the delivery mark is refused outright
//! ([`PushOutcome::OutOfWindow`]).  Accepting it would let one bogus sequence
//! number skip the mark past every prompt the phone will ever send.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::debug;

/// One item the consumer must be told about, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Hand this prompt to the consumer.
    Prompt { seq: u64, text: String },
    /// Prompts `from..=to` are lost.
    Dropped { from: u64, to: u64 },
}

/// Result of [`ReorderBuffer::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The frame (and possibly buffered successors) became deliverable.
    Delivered(Vec<Delivery>),
    /// The frame arrived ahead of a gap and is held back.
    Buffered,
    /// The frame was already delivered or is already buffered.
    Duplicate,
    /// The frame is too far ahead of the delivery mark to be genuine.
    OutOfWindow,
}

/// Per-session receive state: delivery high-water mark plus held-back frames.
#[derive(Debug)]
pub struct ReorderBuffer {
    delivered_through: u64,
    pending: BTreeMap<u64, String>,
    max_pending: usize,
    gap_timeout: Duration,
    /// Largest accepted distance between a new seq and `delivered_through`.
    window: u64,
    /// When the current gap was first observed (or last made progress).
    gap_since: Option<Instant>,
}

impl ReorderBuffer {
    /// Default for [`ReorderBuffer::with_window`].
    pub const DEFAULT_WINDOW: u64 = 4096;

    /// Creates an empty buffer expecting sequence number 1 next.
    ///
    /// `max_pending` is clamped to at least 1.
    pub fn new(max_pending: usize, gap_timeout: Duration) -> Self {
        Self {
            delivered_through: 0,
            pending: BTreeMap::new(),
            max_pending: max_pending.max(1),
            gap_timeout,
            window: Self::DEFAULT_WINDOW,
            gap_since: None,
        }
    }

    /// Sets how far ahead of the delivery mark a frame may be.  Clamped to
    /// at least `max_pending + 1`, so a full buffer can always fill.
    pub fn with_window(mut self, window: u64) -> Self {
        self.window = window.max(self.max_pending as u64 + 1);
        self
    }

    /// Highest sequence number handed off (or skipped); 0 if none.
    pub fn delivered_through(&self) -> u64 {
        self.delivered_through
    }

    /// Number of frames held back behind a gap.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Instant at which the current gap will be declared lost, if a gap exists.
    pub fn deadline(&self) -> Option<Instant> {
        self.gap_since.map(|since| since + self.gap_timeout)
    }

    /// Offers one received prompt to the buffer.
    pub fn push(&mut self, seq: u64, text: String, now: Instant) -> PushOutcome {
        if seq <= self.delivered_through || self.pending.contains_key(&seq) {
            return PushOutcome::Duplicate;
        }
        if seq - self.delivered_through > self.window {
            return PushOutcome::OutOfWindow;
        }

        if self.delivered_through.checked_add(1) == Some(seq) {
            let mut out = vec![Delivery::Prompt { seq, text }];
            self.delivered_through = seq;
            self.drain_contiguous(&mut out);
            self.restart_gap_clock(now);
            return PushOutcome::Delivered(out);
        }

        self.pending.insert(seq, text);
        if self.gap_since.is_none() {
            self.gap_since = Some(now);
        }

        if self.pending.len() > self.max_pending {
            debug!(
                "reorder buffer overflow ({} pending); skipping gap after seq {}",
                self.pending.len(),
                self.delivered_through
            );
            return PushOutcome::Delivered(self.skip_gap(now));
        }

        PushOutcome::Buffered
    }

    /// Declares the current gap lost if it has been open for `gap_timeout`.
    ///
    /// Returns the deliveries this unblocks (empty if nothing expired).
    pub fn expire(&mut self, now: Instant) -> Vec<Delivery> {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                debug!(
                    "gap after seq {} exceeded {:?}; skipping",
                    self.delivered_through, self.gap_timeout
                );
                self.skip_gap(now)
            }
            _ => Vec::new(),
        }
    }

    /// Skips the missing range up to the first buffered frame and drains.
    fn skip_gap(&mut self, now: Instant) -> Vec<Delivery> {
        let Some(&first) = self.pending.keys().next() else {
            self.gap_since = None;
            return Vec::new();
        };

        let mut out = vec![Delivery::Dropped {
            from: self.delivered_through + 1,
            to: first - 1,
        }];
        self.delivered_through = first - 1;
        self.drain_contiguous(&mut out);
        self.restart_gap_clock(now);
        out
    }

    fn drain_contiguous(&mut self, out: &mut Vec<Delivery>) {
        while let Some(next) = self.delivered_through.checked_add(1) {
            let Some(text) = self.pending.remove(&next) else {
                break;
            };
            self.delivered_through = next;
            out.push(Delivery::Prompt { seq: next, text });
        }
    }

    fn restart_gap_clock(&mut self, now: Instant) {
        self.gap_since = if self.pending.is_empty() {
            None
        } else {
            Some(now)
        };
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
