//! Anomaly policy: callbacks invoked when an observation cannot be applied.
//!
//! Every callback has a default body that logs through `tracing`, so an
//! implementation only overrides what it wants to react to.  Apart from
//! [`should_retry_after_race`](AnomalyPolicy::should_retry_after_race), return
//! values never change what the map does; the observation is already
//! rejected by the time the callback runs.
//!
//! # Example
//! ```
//! use driftmap::{Accumulation, AnomalyPolicy, ConnectionKey};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[derive(Default)]
//! struct CountLateData(AtomicU64);
//!
//! impl<A: Accumulation> AnomalyPolicy<A> for CountLateData {
//!     fn on_data_arriving_after_explicit_removal(&self, _key: &ConnectionKey) {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//! ```

use std::time::Duration;

use tracing::{debug, error, warn};

use crate::accumulation::Accumulation;
use crate::key::ConnectionKey;
use crate::time::{duration_millis, TimeBucketKey};

/// Number of retries the default policy grants a connection whose timestamp
/// update keeps losing compare-and-swap races.
pub const MAX_RACE_RETRIES: u32 = 2;

pub trait AnomalyPolicy<A>: Send + Sync + 'static {
    /// The observation is older than the oldest bucket still tracked for the
    /// partition.
    ///
    /// `window_end` is the partition's latest possible bucket boundary at the
    /// time the observation arrived.
    fn on_data_arriving_before_window_start(
        &self,
        partition_id: &str,
        connection_id: &str,
        timestamp: i64,
        window_end: Option<TimeBucketKey>,
    ) {
        error!(
            partition = partition_id,
            connection = connection_id,
            timestamp,
            window_end = ?window_end,
            "observation predates the oldest tracked time bucket for this partition; \
             the minimum guaranteed lifetime may be too short"
        );
    }

    /// The connection's previous bucket was already swept, so its
    /// accumulation has been (or is being) expired.
    fn on_data_arriving_after_expiration(
        &self,
        partition_id: &str,
        connection_id: &str,
        last_timestamp: i64,
        window_end: Option<TimeBucketKey>,
        minimum_guaranteed_lifetime: Duration,
    ) {
        error!(
            partition = partition_id,
            connection = connection_id,
            last_timestamp,
            window_end = ?window_end,
            lifetime_ms = duration_millis(minimum_guaranteed_lifetime),
            "new data arrived after the connection's accumulation expired"
        );
    }

    /// The accumulation carries the dead sentinel: it was removed explicitly.
    fn on_data_arriving_after_explicit_removal(&self, key: &ConnectionKey) {
        warn!(connection = %key, "data arrived for an explicitly removed accumulation");
    }

    /// Another thread moved the accumulation's timestamp between our read and
    /// our compare-and-swap.  `attempts` counts the races lost so far.
    ///
    /// Returning `false` abandons the observation.
    fn should_retry_after_race(
        &self,
        partition_id: &str,
        connection_id: &str,
        timestamp: i64,
        accumulation: &A,
        attempts: u32,
    ) -> bool {
        let _ = accumulation;
        if attempts > MAX_RACE_RETRIES {
            error!(
                partition = partition_id,
                connection = connection_id,
                timestamp,
                attempts,
                "giving up on timestamp update after repeated races; \
                 data for this connection may be corrupted"
            );
            false
        } else {
            true
        }
    }

    /// A sweep evicted the accumulation.  `expire()` has already run.
    fn on_accumulation_expired(&self, partition_id: &str, connection_id: &str, accumulation: &A) {
        let _ = accumulation;
        debug!(partition = partition_id, connection = connection_id, "expired accumulation");
    }
}

/// The policy installed when none is configured: log and carry on.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPolicy;

impl<A: Accumulation> AnomalyPolicy<A> for DefaultPolicy {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::NewestTimestamp;

    struct Acc(NewestTimestamp);

    impl Accumulation for Acc {
        fn newest_timestamp(&self) -> &NewestTimestamp {
            &self.0
        }
    }

    #[test]
    fn default_retry_bound() {
        let acc = Acc(NewestTimestamp::new());
        let policy: &dyn AnomalyPolicy<Acc> = &DefaultPolicy;
        assert!(policy.should_retry_after_race("p", "c", 0, &acc, 1));
        assert!(policy.should_retry_after_race("p", "c", 0, &acc, MAX_RACE_RETRIES));
        assert!(!policy.should_retry_after_race("p", "c", 0, &acc, MAX_RACE_RETRIES + 1));
    }
}
