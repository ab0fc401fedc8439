use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters updated by the map's public operations.
pub struct StatsCounter {
    created: AtomicU64,
    expired: AtomicU64,
    removed: AtomicU64,
    stale_arrivals: AtomicU64,
    arrivals_after_expiration: AtomicU64,
    arrivals_after_removal: AtomicU64,
    race_retries: AtomicU64,
    races_abandoned: AtomicU64,
}

impl StatsCounter {
    pub fn new() -> Self {
        StatsCounter {
            created: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            stale_arrivals: AtomicU64::new(0),
            arrivals_after_expiration: AtomicU64::new(0),
            arrivals_after_removal: AtomicU64::new(0),
            race_retries: AtomicU64::new(0),
            races_abandoned: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_expired(&self, count: u64) {
        self.expired.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_removed(&self) {
        self.removed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale_arrival(&self) {
        self.stale_arrivals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_arrival_after_expiration(&self) {
        self.arrivals_after_expiration.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_arrival_after_removal(&self) {
        self.arrivals_after_removal.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_race_retry(&self) {
        self.race_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_race_abandoned(&self) {
        self.races_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Returns a point-in-time snapshot of the statistics.
    pub fn snapshot(&self) -> Metrics {
        Metrics {
            connections_created: self.created.load(Ordering::Relaxed),
            expirations: self.expired.load(Ordering::Relaxed),
            explicit_removals: self.removed.load(Ordering::Relaxed),
            stale_arrivals: self.stale_arrivals.load(Ordering::Relaxed),
            arrivals_after_expiration: self.arrivals_after_expiration.load(Ordering::Relaxed),
            arrivals_after_removal: self.arrivals_after_removal.load(Ordering::Relaxed),
            race_retries: self.race_retries.load(Ordering::Relaxed),
            races_abandoned: self.races_abandoned.load(Ordering::Relaxed),
        }
    }
}

impl Default for StatsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of map statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Distinct accumulations ever created.
    pub connections_created: u64,
    /// Accumulations evicted by a sweep.
    pub expirations: u64,
    /// Accumulations removed through `remove`.
    pub explicit_removals: u64,
    /// Observations older than the partition's oldest bucket.
    pub stale_arrivals: u64,
    /// Observations whose accumulation's bucket was already swept.
    pub arrivals_after_expiration: u64,
    /// Observations for an explicitly removed accumulation.
    pub arrivals_after_removal: u64,
    /// Compare-and-swap races that were retried.
    pub race_retries: u64,
    /// Observations dropped after exhausting race retries.
    pub races_abandoned: u64,
}

impl Metrics {
    /// Observations that were rejected for any reason.
    pub fn rejected_observations(&self) -> u64 {
        self.stale_arrivals
            + self.arrivals_after_expiration
            + self.arrivals_after_removal
            + self.races_abandoned
    }
}
