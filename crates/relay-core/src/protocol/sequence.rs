//! Thread-safe sequence counter for frame numbering.
//!
//! # What is a sequence number here?
//!
//! Every reliable frame a peer sends (a `Prompt` from the phone, a
//! `StatusChange` from the desktop) carries a per-session, per-direction
//! sequence number.  The receiver uses it to:
//!
//! - **Restore order** – frames that arrive as 2, 1, 3 are handed to the
//!   consumer as 1, 2, 3.
//! - **Discard duplicates** – a prompt retransmitted after a reconnect is
//!   recognised because its number is not above the delivery high-water mark.
//! - **Acknowledge cumulatively** – `Ack{seq: n}` means "everything up to and
//!   including `n` was handed off".
//!
//! Sequence numbers start at 1.  The value 0 is reserved to mean "nothing
//! sent yet" / "nothing delivered yet", which is why a fresh counter does not
//! start at 0.
//!
//! # Thread safety
//!
//! The counter uses `AtomicU64`, so the channel writer and the router can
//! both draw numbers for the same session without a lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// The first sequence number handed out by a fresh counter.
pub const FIRST_SEQ: u64 = 1;

/// A thread-safe, monotonically increasing counter for frame sequence numbers.
///
/// # Examples
///
/// ```rust
/// use relay_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// assert_eq!(counter.last_issued(), 2);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    /// The next value to hand out.
    inner: AtomicU64,
}

impl SequenceCounter {
    /// Creates a new counter whose first call to [`next`](Self::next) returns 1.
    pub fn new() -> Self {
        Self::starting_at(FIRST_SEQ)
    }

    /// Creates a counter whose first call to [`next`](Self::next) returns `first`.
    ///
    /// Used when a session is resumed and numbering must continue where the
    /// previous connection left off.
    pub fn starting_at(first: u64) -> Self {
        Self {
            inner: AtomicU64::new(first),
        }
    }

    /// Returns the next sequence number and atomically increments the counter.
    ///
    /// Wraps from `u64::MAX` to 0 without panicking.  At one frame per
    /// microsecond that takes over half a million years, so wrap handling is
    /// not modelled anywhere else.
    pub fn next(&self) -> u64 {
        // `fetch_add` returns the value *before* the addition.
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the most recently issued number, or 0 if none was issued.
    pub fn last_issued(&self) -> u64 {
        self.inner.load(Ordering::Relaxed).saturating_sub(1)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequence_counter_starts_at_one() {
        // Arrange
        let counter = SequenceCounter::new();

        // Act
        let first = counter.next();

        // Assert
        assert_eq!(first, 1);
    }

    #[test]
    fn test_last_issued_is_zero_before_first_next() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.last_issued(), 0);
    }

    #[test]
    fn test_starting_at_continues_numbering() {
        // Arrange – a resumed session that already used 1..=41
        let counter = SequenceCounter::starting_at(42);

        // Act
        let next = counter.next();

        // Assert
        assert_eq!(next, 42);
        assert_eq!(counter.last_issued(), 42);
    }

    #[test]
    fn test_sequence_counter_increments_monotonically() {
        let counter = SequenceCounter::new();

        let values: Vec<u64> = (0..100).map(|_| counter.next()).collect();

        for window in values.windows(2) {
            assert_eq!(window[1], window[0] + 1, "numbering must be gapless");
        }
    }

    #[test]
    fn test_sequence_counter_wraps_at_u64_max() {
        let counter = SequenceCounter::starting_at(u64::MAX);

        let before_wrap = counter.next();
        let after_wrap = counter.next();

        assert_eq!(before_wrap, u64::MAX);
        assert_eq!(after_wrap, 0);
    }

    #[test]
    fn test_sequence_counter_is_thread_safe() {
        // Arrange
        let counter = Arc::new(SequenceCounter::new());
        let thread_count = 8;
        let increments_per_thread = 1000;

        // Act – increment from many threads simultaneously
        let handles: Vec<_> = (0..thread_count)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || {
                    (0..increments_per_thread)
                        .map(|_| c.next())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all_values: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert – no two threads got the same number
        all_values.sort_unstable();
        all_values.dedup();
        assert_eq!(all_values.len(), thread_count * increments_per_thread);
    }
}
