//! Millisecond timestamps, bucket keys and the per-accumulation timestamp cell.
//!
//! Observation timestamps are raw `i64` epoch milliseconds.  Bucket keys wrap
//! the same unit so window arithmetic never has to convert between clocks.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Converts a wall-clock time into epoch milliseconds.
///
/// Times before the epoch clamp to `0`.
pub fn epoch_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(duration_millis)
        .unwrap_or(0)
}

#[inline]
pub(crate) fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// TimeBucketKey
// ---------------------------------------------------------------------------

/// Start instant of a time bucket, in epoch milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeBucketKey(i64);

impl TimeBucketKey {
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        TimeBucketKey(millis)
    }

    #[inline]
    pub const fn millis(self) -> i64 {
        self.0
    }

    /// `true` if this key lies strictly before the raw timestamp.
    #[inline]
    pub fn is_before(self, timestamp: i64) -> bool {
        self.0 < timestamp
    }

    #[inline]
    pub fn is_after(self, timestamp: i64) -> bool {
        self.0 > timestamp
    }

    #[inline]
    pub fn is_at_or_after(self, timestamp: i64) -> bool {
        self.0 >= timestamp
    }

    pub fn plus(self, d: Duration) -> Self {
        TimeBucketKey(self.0.saturating_add(duration_millis(d)))
    }

    pub fn minus(self, d: Duration) -> Self {
        TimeBucketKey(self.0.saturating_sub(duration_millis(d)))
    }
}

impl From<SystemTime> for TimeBucketKey {
    fn from(time: SystemTime) -> Self {
        TimeBucketKey(epoch_millis(time))
    }
}

impl fmt::Display for TimeBucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ---------------------------------------------------------------------------
// NewestTimestamp
// ---------------------------------------------------------------------------

/// The newest observed timestamp of one accumulation.
///
/// Starts out as [`NewestTimestamp::NOT_SET`] and only moves forward through
/// [`compare_exchange`](Self::compare_exchange), except for the one-way
/// transition to [`NewestTimestamp::DEAD`] on explicit removal.
#[derive(Debug)]
pub struct NewestTimestamp {
    millis: AtomicI64,
}

impl NewestTimestamp {
    /// No observation has been recorded yet.
    pub const NOT_SET: i64 = i64::MIN;
    /// The accumulation was explicitly removed and must never be revived.
    pub const DEAD: i64 = i64::MAX;

    pub const fn new() -> Self {
        NewestTimestamp {
            millis: AtomicI64::new(Self::NOT_SET),
        }
    }

    #[inline]
    pub fn load(&self) -> i64 {
        self.millis.load(Ordering::Acquire)
    }

    /// Swaps `current` for `new` if the cell still holds `current`.
    ///
    /// On failure returns the value another thread stored in the meantime.
    #[inline]
    pub fn compare_exchange(&self, current: i64, new: i64) -> Result<i64, i64> {
        self.millis
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Kills the cell and returns what it held before.
    pub fn mark_dead(&self) -> i64 {
        self.millis.swap(Self::DEAD, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.load() == Self::DEAD
    }

    /// `true` once a real observation has been stored (and not killed).
    #[inline]
    pub fn is_set(&self) -> bool {
        let v = self.load();
        v != Self::NOT_SET && v != Self::DEAD
    }
}

impl Default for NewestTimestamp {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_comparisons_against_raw_timestamps() {
        let k = TimeBucketKey::from_millis(1_000);
        assert!(k.is_before(1_001));
        assert!(!k.is_before(1_000));
        assert!(k.is_after(999));
        assert!(k.is_at_or_after(1_000));
        assert!(!k.is_at_or_after(1_001));
    }

    #[test]
    fn key_arithmetic_saturates() {
        let k = TimeBucketKey::from_millis(500);
        assert_eq!(k.plus(Duration::from_millis(100)).millis(), 600);
        assert_eq!(k.minus(Duration::from_millis(1_000)).millis(), -500);
        let max = TimeBucketKey::from_millis(i64::MAX - 1);
        assert_eq!(max.plus(Duration::from_secs(10)).millis(), i64::MAX);
    }

    #[test]
    fn epoch_millis_clamps_pre_epoch() {
        let before = UNIX_EPOCH - Duration::from_secs(5);
        assert_eq!(epoch_millis(before), 0);
        assert_eq!(epoch_millis(UNIX_EPOCH + Duration::from_millis(1_234)), 1_234);
    }

    #[test]
    fn newest_timestamp_lifecycle() {
        let ts = NewestTimestamp::new();
        assert!(!ts.is_set());
        assert_eq!(ts.load(), NewestTimestamp::NOT_SET);

        assert_eq!(ts.compare_exchange(NewestTimestamp::NOT_SET, 0), Ok(NewestTimestamp::NOT_SET));
        assert!(ts.is_set(), "zero is a real observation");

        // Stale expected value loses and reports the winner.
        assert_eq!(ts.compare_exchange(NewestTimestamp::NOT_SET, 10), Err(0));

        assert_eq!(ts.mark_dead(), 0);
        assert!(ts.is_dead());
        assert!(!ts.is_set());
    }
}
