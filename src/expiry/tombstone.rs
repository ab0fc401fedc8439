use std::sync::Arc;

use crate::time::NewestTimestamp;

/// An explicitly removed accumulation, remembered so that late observations
/// for it can still be recognised.
///
/// A tombstone is *parked* at the timestamp of the bucket its connection id
/// was left in.  The sweep forgets it once that bucket is dropped.  An
/// unparked tombstone belongs to a partition that had no buckets yet when
/// the accumulation was removed.
pub struct Tombstone<A> {
    accumulation: Arc<A>,
    parked_at: NewestTimestamp,
}

impl<A> Tombstone<A> {
    pub fn new(accumulation: Arc<A>) -> Self {
        Tombstone {
            accumulation,
            parked_at: NewestTimestamp::new(),
        }
    }

    pub fn accumulation(&self) -> &Arc<A> {
        &self.accumulation
    }

    /// Parks the tombstone at `timestamp`.  Only the first call wins.
    pub fn park(&self, timestamp: i64) -> bool {
        self.parked_at
            .compare_exchange(NewestTimestamp::NOT_SET, timestamp)
            .is_ok()
    }

    pub fn parked_at(&self) -> Option<i64> {
        let at = self.parked_at.load();
        (at != NewestTimestamp::NOT_SET).then_some(at)
    }
}
