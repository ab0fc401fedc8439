use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::accumulation::Accumulation;
use crate::anomaly::AnomalyPolicy;
use crate::builder::MapBuilder;
use crate::expiry::bucket_set::{ConnectionBucket, TimeBucketedConnectionSet};
use crate::expiry::tombstone::Tombstone;
use crate::key::ConnectionKey;
use crate::metrics::stats::{Metrics, StatsCounter};
use crate::store::sharded::ShardedStore;
use crate::time::NewestTimestamp;

/// Shard count for the partition table; partitions are few and long-lived.
const PARTITION_SHARDS: usize = 8;

#[inline]
fn assert_observable(timestamp: i64) {
    assert!(
        timestamp != NewestTimestamp::NOT_SET && timestamp != NewestTimestamp::DEAD,
        "observation timestamp {timestamp} collides with a reserved sentinel"
    );
}

// ---------------------------------------------------------------------------
// Map interior
// ---------------------------------------------------------------------------

/// Shared interior of an [`ExpiringAccumulationMap`].
pub(crate) struct Inner<A> {
    pub(crate) accumulations: ShardedStore<ConnectionKey, A>,
    /// Explicitly removed accumulations whose connection id still sits in a
    /// bucket.  Lets late observations be recognised as such.
    pub(crate) tombstones: ShardedStore<ConnectionKey, Tombstone<A>>,
    pub(crate) partitions: ShardedStore<String, TimeBucketedConnectionSet>,
    pub(crate) policy: Box<dyn AnomalyPolicy<A>>,
    pub(crate) minimum_guaranteed_lifetime: Duration,
    pub(crate) granularity: Duration,
    pub(crate) metrics: StatsCounter,
}

// ---------------------------------------------------------------------------
// Map handle
// ---------------------------------------------------------------------------

/// Correlates timestamped observations of many concurrent connections into
/// one accumulation per connection, and evicts accumulations that have gone
/// quiet for longer than the minimum guaranteed lifetime.
///
/// Eviction is driven by observations: whenever an observation opens a new
/// time bucket in its partition, that partition is swept.  There is no
/// background thread.
///
/// # Example
/// ```
/// use driftmap::{Accumulation, ConnectionKey, ExpiringAccumulationMap, NewestTimestamp};
/// use std::time::Duration;
///
/// #[derive(Default)]
/// struct Flow {
///     newest: NewestTimestamp,
/// }
///
/// impl Accumulation for Flow {
///     fn newest_timestamp(&self) -> &NewestTimestamp {
///         &self.newest
///     }
/// }
///
/// let map: ExpiringAccumulationMap<Flow> = ExpiringAccumulationMap::builder()
///     .minimum_guaranteed_lifetime(Duration::from_secs(1))
///     .granularity(Duration::from_millis(100))
///     .build()
///     .unwrap();
///
/// let c1 = ConnectionKey::new("node-a", "c1");
/// let flow = map.get_or_create(&c1, |_| Flow::default());
/// assert!(map.touch_and_maybe_expire(&c1, &flow, 0));
///
/// // Activity elsewhere in the partition pushes c1 out of the window.
/// let c2 = ConnectionKey::new("node-a", "c2");
/// let other = map.get_or_create(&c2, |_| Flow::default());
/// map.touch_and_maybe_expire(&c2, &other, 2_000);
///
/// assert!(map.get_if_live(&c1, 2_000).is_none());
/// ```
pub struct ExpiringAccumulationMap<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for ExpiringAccumulationMap<A> {
    fn clone(&self) -> Self {
        ExpiringAccumulationMap {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Accumulation> ExpiringAccumulationMap<A> {
    pub(crate) fn new(
        minimum_guaranteed_lifetime: Duration,
        granularity: Duration,
        num_shards: usize,
        policy: Box<dyn AnomalyPolicy<A>>,
    ) -> Self {
        ExpiringAccumulationMap {
            inner: Arc::new(Inner {
                accumulations: ShardedStore::new(num_shards),
                tombstones: ShardedStore::new(num_shards),
                partitions: ShardedStore::new(PARTITION_SHARDS),
                policy,
                minimum_guaranteed_lifetime,
                granularity,
                metrics: StatsCounter::new(),
            }),
        }
    }

    /// Returns a [`MapBuilder`] for constructing a new map.
    pub fn builder() -> MapBuilder<A> {
        MapBuilder::new()
    }

    // -----------------------------------------------------------------------
    // Observation path
    // -----------------------------------------------------------------------

    /// Returns the accumulation for `key` if it is still live, recording an
    /// observation at `timestamp` against it.
    ///
    /// `None` means either no accumulation exists or the observation was
    /// rejected (stale, after expiration, after removal, or lost too many
    /// races).  A rejected accumulation is not removed here.
    ///
    /// # Panics
    ///
    /// Panics if `timestamp` is `i64::MIN` or `i64::MAX`, the values
    /// [`NewestTimestamp`] reserves for its sentinels.
    pub fn get_if_live(&self, key: &ConnectionKey, timestamp: i64) -> Option<Arc<A>> {
        assert_observable(timestamp);
        let accumulation = self.inner.accumulations.get(key).or_else(|| {
            self.inner
                .tombstones
                .get(key)
                .map(|t| Arc::clone(t.accumulation()))
        })?;
        if self.update_expiration_trackers(key, timestamp, &accumulation) {
            Some(accumulation)
        } else {
            None
        }
    }

    /// Returns the accumulation for `key`, creating it with `make` if absent.
    ///
    /// No expiration bookkeeping happens here; the new accumulation joins a
    /// time bucket on its first observation.
    pub fn get_or_create<F>(&self, key: &ConnectionKey, make: F) -> Arc<A>
    where
        F: FnOnce(&ConnectionKey) -> A,
    {
        let (accumulation, created) = self
            .inner
            .accumulations
            .get_or_insert_with(key, || make(key));
        if created {
            self.inner.metrics.record_created();
            self.inner.tombstones.remove(key);
            trace!(connection = %key, "created accumulation");
        }
        accumulation
    }

    /// Records an observation at `timestamp` for an accumulation the caller
    /// already holds.
    ///
    /// Returns `true` if the accumulation is still live.  Otherwise it is
    /// dropped from the map, provided the map still holds this very
    /// accumulation for `key`.
    ///
    /// # Panics
    ///
    /// Panics on the same reserved timestamps as [`get_if_live`](Self::get_if_live).
    pub fn touch_and_maybe_expire(&self, key: &ConnectionKey, accumulation: &Arc<A>, timestamp: i64) -> bool {
        assert_observable(timestamp);
        if self.update_expiration_trackers(key, timestamp, accumulation) {
            return true;
        }
        self.inner
            .accumulations
            .remove_if(key, |current| Arc::ptr_eq(current, accumulation));
        false
    }

    /// Removes the accumulation for a connection and marks it dead, so that
    /// observations still in flight for it are rejected.
    ///
    /// The connection id stays in its time bucket until a sweep reaches it.
    /// An accumulation that was never observed is parked in its partition's
    /// newest bucket instead.
    pub fn remove(&self, partition_id: &str, connection_id: &str) -> Option<Arc<A>> {
        let key = ConnectionKey::new(partition_id, connection_id);
        let accumulation = self.inner.accumulations.remove(&key)?;
        let previous = accumulation.newest_timestamp().mark_dead();
        if previous != NewestTimestamp::DEAD {
            let tombstone = Arc::new(Tombstone::new(Arc::clone(&accumulation)));
            self.inner.tombstones.insert(key.clone(), Arc::clone(&tombstone));
            if previous != NewestTimestamp::NOT_SET {
                tombstone.park(previous);
            } else if let Some(partition) = self.inner.partitions.get(partition_id) {
                self.park(&partition, &key, &tombstone);
            }
        }
        self.inner.metrics.record_removed();
        debug!(connection = %key, "removed accumulation");
        Some(accumulation)
    }

    // -----------------------------------------------------------------------
    // Update protocol
    // -----------------------------------------------------------------------

    fn bucket_set(&self, partition_id: &str, first_timestamp: i64) -> Arc<TimeBucketedConnectionSet> {
        let granularity = self.inner.granularity;
        let (partition, created) = self.inner.partitions.get_or_insert_with(partition_id, || {
            TimeBucketedConnectionSet::new(partition_id, granularity, first_timestamp)
        });
        if created {
            self.park_orphans(&partition);
        }
        partition
    }

    /// Parks the tombstones removed before `partition` had any bucket.
    fn park_orphans(&self, partition: &TimeBucketedConnectionSet) {
        for (key, tombstone) in self.inner.tombstones.entries() {
            if key.partition_id() == partition.partition_id() && tombstone.parked_at().is_none() {
                self.park(partition, &key, &tombstone);
            }
        }
    }

    /// Leaves `key`'s connection id in the newest bucket so the sweep can
    /// eventually forget the tombstone.
    fn park(&self, partition: &TimeBucketedConnectionSet, key: &ConnectionKey, tombstone: &Tombstone<A>) {
        let Some(latest) = partition.latest_key() else {
            return;
        };
        let Some(bucket) = partition.bucket_for(latest.millis(), || {}) else {
            return;
        };
        if tombstone.park(latest.millis()) {
            bucket.insert(key.connection_id());
            trace!(connection = %key, bucket = %latest, "parked tombstone");
        }
    }

    /// Advances the accumulation's timestamp and moves its connection id into
    /// the bucket for that timestamp.  Returns `false` if the observation had
    /// to be rejected.
    fn update_expiration_trackers(&self, key: &ConnectionKey, observed: i64, accumulation: &A) -> bool {
        let inner = &*self.inner;
        let partition = self.bucket_set(key.partition_id(), observed);
        let newest = accumulation.newest_timestamp();
        let mut attempts = 0u32;

        loop {
            let window_end = partition.latest_possible_boundary();
            // Bucket tracking only ever moves forward, even when observations
            // arrive slightly out of order.
            let effective = partition
                .latest_key()
                .map_or(observed, |k| observed.max(k.millis()));

            let last = newest.load();
            if last == NewestTimestamp::DEAD {
                inner.metrics.record_arrival_after_removal();
                inner.policy.on_data_arriving_after_explicit_removal(key);
                return false;
            }

            if effective > last && newest.compare_exchange(last, effective).is_err() {
                attempts += 1;
                if inner.policy.should_retry_after_race(
                    key.partition_id(),
                    key.connection_id(),
                    effective,
                    accumulation,
                    attempts,
                ) {
                    inner.metrics.record_race_retry();
                    continue;
                }
                inner.metrics.record_race_abandoned();
                return false;
            }

            // Only reachable when a concurrent sweep drops every bucket up to
            // `effective` between reading the latest key and this lookup.
            let Some(target) = self.bucket_for(&partition, effective) else {
                inner.metrics.record_stale_arrival();
                inner.policy.on_data_arriving_before_window_start(
                    key.partition_id(),
                    key.connection_id(),
                    effective,
                    window_end,
                );
                return false;
            };

            let mut home = target;
            if last != NewestTimestamp::NOT_SET {
                let Some(source) = self.bucket_for(&partition, last) else {
                    inner.metrics.record_arrival_after_expiration();
                    inner.policy.on_data_arriving_after_expiration(
                        key.partition_id(),
                        key.connection_id(),
                        last,
                        window_end,
                        inner.minimum_guaranteed_lifetime,
                    );
                    return false;
                };
                if last >= effective {
                    // Nothing advanced; never move a connection backwards.
                    home = source;
                } else if !Arc::ptr_eq(&source, &home) {
                    // No-op if a sweep already dropped it.
                    source.remove(key.connection_id());
                }
            }

            home.insert(key.connection_id());

            // A newer observation that lands past this bucket's span owns the
            // connection's bucket membership from here on.
            let newest_now = newest.load();
            if newest_now != NewestTimestamp::DEAD
                && !home.key().plus(inner.granularity).is_after(newest_now)
            {
                home.remove(key.connection_id());
            }
            return true;
        }
    }

    /// Looks up the bucket for `timestamp`, sweeping the partition whenever a
    /// new bucket is opened.
    fn bucket_for(&self, partition: &TimeBucketedConnectionSet, timestamp: i64) -> Option<Arc<ConnectionBucket>> {
        partition.bucket_for(timestamp, || {
            let expired = partition.sweep_expired(
                &self.inner.accumulations,
                &self.inner.tombstones,
                &*self.inner.policy,
                self.inner.minimum_guaranteed_lifetime,
                timestamp,
            );
            if expired > 0 {
                self.inner.metrics.record_expired(expired as u64);
            }
        })
    }

    // -----------------------------------------------------------------------
    // Bulk / admin operations
    // -----------------------------------------------------------------------

    /// Snapshot of the live accumulations.
    pub fn values(&self) -> impl Iterator<Item = Arc<A>> {
        self.inner.accumulations.values().into_iter()
    }

    /// Snapshot of the live accumulations with their keys.
    pub fn entries(&self) -> impl Iterator<Item = (ConnectionKey, Arc<A>)> {
        self.inner.accumulations.entries().into_iter()
    }

    /// Drops every partition's time buckets.
    ///
    /// Accumulations stay in the map.  Their next observation finds its old
    /// bucket gone and is rejected as arriving after expiration.
    pub fn clear(&self) {
        self.inner.partitions.clear();
        self.inner.tombstones.clear();
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// The time buckets of one partition, if it has seen any observation.
    pub fn bucket_set_for(&self, partition_id: &str) -> Option<Arc<TimeBucketedConnectionSet>> {
        self.inner.partitions.get(partition_id)
    }

    pub fn partition_count(&self) -> usize {
        self.inner.partitions.len()
    }

    /// Number of distinct accumulations ever created.
    pub fn new_connection_count(&self) -> u64 {
        self.inner.metrics.created()
    }

    pub fn stats(&self) -> Metrics {
        self.inner.metrics.snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.accumulations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.accumulations.is_empty()
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.inner.accumulations.contains(key)
    }

    pub fn minimum_guaranteed_lifetime(&self) -> Duration {
        self.inner.minimum_guaranteed_lifetime
    }

    pub fn granularity(&self) -> Duration {
        self.inner.granularity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeBucketKey;

    #[derive(Default)]
    struct Acc {
        newest: NewestTimestamp,
    }

    impl Accumulation for Acc {
        fn newest_timestamp(&self) -> &NewestTimestamp {
            &self.newest
        }
    }

    fn map() -> ExpiringAccumulationMap<Acc> {
        ExpiringAccumulationMap::builder()
            .minimum_guaranteed_lifetime(Duration::from_millis(1_000))
            .granularity(Duration::from_millis(100))
            .build()
            .unwrap()
    }

    #[test]
    fn first_observation_seeds_partition() {
        let m = map();
        let key = ConnectionKey::new("p", "c1");
        let acc = m.get_or_create(&key, |_| Acc::default());
        assert!(m.bucket_set_for("p").is_none());

        assert!(m.touch_and_maybe_expire(&key, &acc, 1_234));
        let set = m.bucket_set_for("p").unwrap();
        assert_eq!(set.bucket_keys(), vec![TimeBucketKey::from_millis(1_234)]);
        assert_eq!(acc.newest.load(), 1_234);
        assert_eq!(m.partition_count(), 1);
    }

    #[test]
    fn out_of_order_observation_uses_latest_bucket() {
        let m = map();
        let k1 = ConnectionKey::new("p", "c1");
        let k2 = ConnectionKey::new("p", "c2");
        let a1 = m.get_or_create(&k1, |_| Acc::default());
        let a2 = m.get_or_create(&k2, |_| Acc::default());

        assert!(m.touch_and_maybe_expire(&k1, &a1, 0));
        assert!(m.touch_and_maybe_expire(&k1, &a1, 300));
        // c2 shows up "in the past"; its tracking timestamp is pushed forward.
        assert!(m.touch_and_maybe_expire(&k2, &a2, 50));
        assert_eq!(a2.newest.load(), 300);

        let set = m.bucket_set_for("p").unwrap();
        assert_eq!(set.buckets_containing("c2"), vec![TimeBucketKey::from_millis(300)]);
    }

    #[test]
    fn touch_failure_removes_only_same_accumulation() {
        let m = map();
        let key = ConnectionKey::new("p", "c1");
        let stale = m.get_or_create(&key, |_| Acc::default());
        assert!(m.touch_and_maybe_expire(&key, &stale, 5_000));

        m.remove("p", "c1");
        let fresh = m.get_or_create(&key, |_| Acc::default());
        assert!(!Arc::ptr_eq(&stale, &fresh));

        // The old, dead handle fails but must not take the new one with it.
        assert!(!m.touch_and_maybe_expire(&key, &stale, 5_001));
        assert!(m.contains(&key));
    }

    #[test]
    fn partition_clock_absorbs_late_first_packets() {
        let m = map();
        let k1 = ConnectionKey::new("p", "c1");
        let k2 = ConnectionKey::new("p", "c2");
        let a1 = m.get_or_create(&k1, |_| Acc::default());
        assert!(m.touch_and_maybe_expire(&k1, &a1, 10_000));

        // A brand-new connection whose first packet is older than any bucket.
        // The partition clock pushes it to 10_000, so it is still accepted.
        let a2 = m.get_or_create(&k2, |_| Acc::default());
        assert!(m.touch_and_maybe_expire(&k2, &a2, 1));
        assert_eq!(m.stats().stale_arrivals, 0);

        // After a clear, the partition is re-seeded by the next observation.
        m.clear();
        let k3 = ConnectionKey::new("p", "c3");
        let a3 = m.get_or_create(&k3, |_| Acc::default());
        assert!(m.touch_and_maybe_expire(&k3, &a3, 20_000));
        assert_eq!(
            m.bucket_set_for("p").unwrap().earliest_key(),
            Some(TimeBucketKey::from_millis(20_000))
        );

        // Pre-clear accumulations have lost their bucket.
        assert!(!m.touch_and_maybe_expire(&k1, &a1, 20_000));
        assert!(!m.contains(&k1));
    }

    #[test]
    fn arrival_after_own_bucket_expired() {
        let m = map();
        let k1 = ConnectionKey::new("p", "c1");
        let k2 = ConnectionKey::new("p", "c2");
        let a1 = m.get_or_create(&k1, |_| Acc::default());
        let a2 = m.get_or_create(&k2, |_| Acc::default());
        assert!(m.touch_and_maybe_expire(&k1, &a1, 0));
        assert!(m.touch_and_maybe_expire(&k2, &a2, 5_000));
        assert!(!m.contains(&k1));

        // The caller still holds c1: its bucket is gone.
        assert!(!m.touch_and_maybe_expire(&k1, &a1, 5_000));
        let stats = m.stats();
        assert_eq!(stats.arrivals_after_expiration, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    #[should_panic(expected = "reserved sentinel")]
    fn dead_sentinel_is_not_an_observation() {
        let m = map();
        let key = ConnectionKey::new("p", "c1");
        let acc = m.get_or_create(&key, |_| Acc::default());
        assert!(m.touch_and_maybe_expire(&key, &acc, 0));
        m.get_if_live(&key, i64::MAX);
    }

    #[test]
    #[should_panic(expected = "reserved sentinel")]
    fn unset_sentinel_is_not_an_observation() {
        let m = map();
        let key = ConnectionKey::new("p", "c1");
        let acc = m.get_or_create(&key, |_| Acc::default());
        m.touch_and_maybe_expire(&key, &acc, i64::MIN);
    }

    #[test]
    fn unobserved_removal_parks_in_newest_bucket() {
        let m = map();
        let k0 = ConnectionKey::new("p", "c0");
        let a0 = m.get_or_create(&k0, |_| Acc::default());
        assert!(m.touch_and_maybe_expire(&k0, &a0, 0));
        assert!(m.touch_and_maybe_expire(&k0, &a0, 300));

        let k1 = ConnectionKey::new("p", "c1");
        m.get_or_create(&k1, |_| Acc::default());
        m.remove("p", "c1");
        let set = m.bucket_set_for("p").unwrap();
        assert_eq!(set.buckets_containing("c1"), vec![TimeBucketKey::from_millis(300)]);
        assert!(m.inner.tombstones.contains(&k1));

        // Dropping bucket 300 forgets the tombstone.
        let k2 = ConnectionKey::new("p", "c2");
        let a2 = m.get_or_create(&k2, |_| Acc::default());
        assert!(m.touch_and_maybe_expire(&k2, &a2, 1_400));
        assert!(!m.inner.tombstones.contains(&k1));
    }

    #[test]
    fn unobserved_removal_in_unseen_partition_parks_on_first_bucket() {
        let m = map();
        let key = ConnectionKey::new("q", "c1");
        m.get_or_create(&key, |_| Acc::default());
        m.remove("q", "c1");
        assert!(m.bucket_set_for("q").is_none());

        assert!(m.get_if_live(&key, 700).is_none());
        let set = m.bucket_set_for("q").unwrap();
        assert_eq!(set.buckets_containing("c1"), vec![TimeBucketKey::from_millis(700)]);
        assert_eq!(m.stats().arrivals_after_removal, 1);
    }

    #[test]
    fn new_connection_count_counts_creations_only() {
        let m = map();
        let key = ConnectionKey::new("p", "c1");
        m.get_or_create(&key, |_| Acc::default());
        m.get_or_create(&key, |_| Acc::default());
        m.get_or_create(&ConnectionKey::new("p", "c2"), |_| Acc::default());
        assert_eq!(m.new_connection_count(), 2);
        assert_eq!(m.len(), 2);
    }
}
