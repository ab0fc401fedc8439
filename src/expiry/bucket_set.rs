//! Quantized time buckets of connection ids for one partition.
//!
//! ## Layout
//!
//! Buckets are kept in a lock-free ordered map keyed by [`TimeBucketKey`].
//! The first bucket is keyed by the first timestamp ever observed in the
//! partition; that instant is the reference every later key is aligned to:
//!
//! ```text
//! key(t) = floor + ⌊(t − floor) / granularity⌋ × granularity
//! ```
//!
//! where `floor` is the latest existing key `≤ t`.  Because every existing
//! key is itself aligned, new keys never drift from the reference and two
//! buckets never overlap.
//!
//! ## Sweeping
//!
//! A sweep walks buckets oldest-first while their key is strictly before
//! `latest_observed − minimum_guaranteed_lifetime`.  Each connection in such a
//! bucket is evicted only if its accumulation has not been touched since; the
//! bucket itself is then dropped.  Connection ids that were already moved to a
//! newer bucket fall away with the bucket, as do tombstones parked in it.

use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_skiplist::{SkipMap, SkipSet};
use tracing::{debug, trace};

use crate::accumulation::Accumulation;
use crate::anomaly::AnomalyPolicy;
use crate::expiry::tombstone::Tombstone;
use crate::key::ConnectionKey;
use crate::store::sharded::ShardedStore;
use crate::time::{duration_millis, NewestTimestamp, TimeBucketKey};

// ---------------------------------------------------------------------------
// ConnectionBucket
// ---------------------------------------------------------------------------

/// Concurrent set of the connection ids last seen within one bucket's span.
#[derive(Debug)]
pub struct ConnectionBucket {
    key: TimeBucketKey,
    ids: SkipSet<String>,
}

impl ConnectionBucket {
    pub fn new(key: TimeBucketKey) -> Self {
        ConnectionBucket {
            key,
            ids: SkipSet::new(),
        }
    }

    /// Start of the span this bucket covers.
    pub fn key(&self) -> TimeBucketKey {
        self.key
    }

    pub fn insert(&self, connection_id: &str) {
        if !self.ids.contains(connection_id) {
            self.ids.insert(connection_id.to_owned());
        }
    }

    /// No-op if the id is not present.
    pub fn remove(&self, connection_id: &str) -> bool {
        self.ids.remove(connection_id).is_some()
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.ids.contains(connection_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.ids.iter().map(|e| e.value().clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// TimeBucketedConnectionSet
// ---------------------------------------------------------------------------

/// Time-ordered buckets of connection ids for one partition.
pub struct TimeBucketedConnectionSet {
    partition_id: String,
    granularity: Duration,
    granularity_ms: i64,
    buckets: SkipMap<TimeBucketKey, Arc<ConnectionBucket>>,
}

impl TimeBucketedConnectionSet {
    /// Creates the set with a single empty bucket keyed at `first_timestamp`.
    ///
    /// # Panics
    ///
    /// Panics if `granularity` is shorter than one millisecond.
    pub fn new(partition_id: impl Into<String>, granularity: Duration, first_timestamp: i64) -> Self {
        let granularity_ms = duration_millis(granularity);
        assert!(granularity_ms > 0, "granularity must be at least one millisecond");
        let first_key = TimeBucketKey::from_millis(first_timestamp);
        let buckets = SkipMap::new();
        buckets.insert(first_key, Arc::new(ConnectionBucket::new(first_key)));
        TimeBucketedConnectionSet {
            partition_id: partition_id.into(),
            granularity,
            granularity_ms,
            buckets,
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn granularity(&self) -> Duration {
        self.granularity
    }

    pub fn earliest_key(&self) -> Option<TimeBucketKey> {
        self.buckets.front().map(|e| *e.key())
    }

    pub fn latest_key(&self) -> Option<TimeBucketKey> {
        self.buckets.back().map(|e| *e.key())
    }

    /// End of the newest bucket: observations at or past this instant will
    /// open a new bucket.
    pub fn latest_possible_boundary(&self) -> Option<TimeBucketKey> {
        self.latest_key().map(|k| k.plus(self.granularity))
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Snapshot of the live bucket keys, oldest first.
    pub fn bucket_keys(&self) -> Vec<TimeBucketKey> {
        self.buckets.iter().map(|e| *e.key()).collect()
    }

    /// Keys of every bucket that currently holds `connection_id`.
    pub fn buckets_containing(&self, connection_id: &str) -> Vec<TimeBucketKey> {
        self.buckets
            .iter()
            .filter(|e| e.value().contains(connection_id))
            .map(|e| *e.key())
            .collect()
    }

    fn quantize(&self, floor: TimeBucketKey, timestamp: i64) -> TimeBucketKey {
        let offset = timestamp.saturating_sub(floor.millis());
        let steps = offset / self.granularity_ms;
        TimeBucketKey::from_millis(
            floor
                .millis()
                .saturating_add(steps.saturating_mul(self.granularity_ms)),
        )
    }

    /// Returns the bucket that `timestamp` belongs to, creating it if needed.
    ///
    /// Returns `None` when `timestamp` is older than the oldest retained
    /// bucket.  `on_new_bucket_created` runs after a new key was inserted (or
    /// lost the insert race to an identical key).
    pub fn bucket_for<F>(&self, timestamp: i64, on_new_bucket_created: F) -> Option<Arc<ConnectionBucket>>
    where
        F: FnOnce(),
    {
        let floor = self
            .buckets
            .upper_bound(Bound::Included(&TimeBucketKey::from_millis(timestamp)))?;
        let floor_key = *floor.key();
        if floor_key.plus(self.granularity).is_after(timestamp) {
            return Some(Arc::clone(floor.value()));
        }

        let new_key = self.quantize(floor_key, timestamp);
        let entry = self
            .buckets
            .get_or_insert(new_key, Arc::new(ConnectionBucket::new(new_key)));
        let bucket = Arc::clone(entry.value());
        trace!(partition = %self.partition_id, bucket = %new_key, "opened time bucket");
        on_new_bucket_created();
        Some(bucket)
    }

    /// Evicts accumulations whose newest timestamp predates the window and
    /// drops the buckets that held them.
    ///
    /// Tombstones of explicitly removed accumulations are forgotten together
    /// with the bucket they are parked in.  Returns how many accumulations
    /// were expired by this call.
    pub fn sweep_expired<A: Accumulation>(
        &self,
        accumulations: &ShardedStore<ConnectionKey, A>,
        tombstones: &ShardedStore<ConnectionKey, Tombstone<A>>,
        policy: &dyn AnomalyPolicy<A>,
        minimum_guaranteed_lifetime: Duration,
        latest_observed: i64,
    ) -> usize {
        let window_start = latest_observed.saturating_sub(duration_millis(minimum_guaranteed_lifetime));
        let mut expired = 0;

        while let Some(oldest) = self.buckets.front() {
            if !oldest.key().is_before(window_start) {
                break;
            }
            let bucket_end = oldest.key().plus(self.granularity);
            for id in oldest.value().ids.iter() {
                let key = ConnectionKey::new(self.partition_id.as_str(), id.value().as_str());
                let evicted = accumulations.remove_if(&key, |acc| {
                    let newest = acc.newest_timestamp().load();
                    newest != NewestTimestamp::NOT_SET && newest < window_start
                });
                if let Some(acc) = evicted {
                    acc.expire();
                    policy.on_accumulation_expired(&self.partition_id, key.connection_id(), &acc);
                    expired += 1;
                }
                // Only tombstones parked here go; a later life of the same
                // connection may be parked further on.
                tombstones.remove_if(&key, |t| {
                    t.parked_at().is_some_and(|at| bucket_end.is_after(at))
                });
            }
            debug!(
                partition = %self.partition_id,
                bucket = %oldest.key(),
                window_start,
                "dropped expired time bucket"
            );
            oldest.remove();
        }
        expired
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
