use std::time::Duration;
use crate::accumulation::Accumulation;
use crate::anomaly::{AnomalyPolicy, DefaultPolicy};
use crate::config::{validate_window, WindowConfig};
use crate::error::ConfigError;
use crate::map::ExpiringAccumulationMap;

/// Builder for configuring and constructing an [`ExpiringAccumulationMap`].
///
/// # Example
/// ```
/// use driftmap::{Accumulation, MapBuilder, NewestTimestamp};
/// use std::time::Duration;
///
/// struct Flow(NewestTimestamp);
///
/// impl Accumulation for Flow {
///     fn newest_timestamp(&self) -> &NewestTimestamp {
///         &self.0
///     }
/// }
///
/// let map = MapBuilder::<Flow>::new()
///     .minimum_guaranteed_lifetime(Duration::from_secs(30))
///     .granularity(Duration::from_secs(1))
///     .build()
///     .unwrap();
/// assert_eq!(map.granularity(), Duration::from_secs(1));
/// ```
pub struct MapBuilder<A> {
    minimum_guaranteed_lifetime: Duration,
    granularity: Duration,
    num_shards: usize,
    policy: Box<dyn AnomalyPolicy<A>>,
}

impl<A: Accumulation> MapBuilder<A> {
    pub fn new() -> Self {
        Self::from_config(&WindowConfig::default())
    }

    /// Starts from a loaded [`WindowConfig`]; validation happens in `build`.
    pub fn from_config(config: &WindowConfig) -> Self {
        MapBuilder {
            minimum_guaranteed_lifetime: config.minimum_guaranteed_lifetime(),
            granularity: config.granularity(),
            num_shards: 64,
            policy: Box::new(DefaultPolicy),
        }
    }

    /// How long, at minimum, an idle accumulation stays queryable after its
    /// last observation.
    pub fn minimum_guaranteed_lifetime(mut self, lifetime: Duration) -> Self {
        self.minimum_guaranteed_lifetime = lifetime;
        self
    }

    /// Width of one time bucket.
    ///
    /// Narrow buckets retain idle accumulations for less time past their
    /// guaranteed lifetime, at the cost of opening (and sweeping) more often.
    pub fn granularity(mut self, granularity: Duration) -> Self {
        self.granularity = granularity;
        self
    }

    /// Set the number of accumulation shards (must be a power of two; default: 64).
    pub fn num_shards(mut self, n: usize) -> Self {
        self.num_shards = n;
        self
    }

    /// Install the policy notified about rejected observations and expirations.
    pub fn anomaly_policy<P: AnomalyPolicy<A>>(mut self, policy: P) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn build(self) -> Result<ExpiringAccumulationMap<A>, ConfigError> {
        validate_window(self.minimum_guaranteed_lifetime, self.granularity)?;
        if !self.num_shards.is_power_of_two() {
            return Err(ConfigError::InvalidShardCount(self.num_shards));
        }
        Ok(ExpiringAccumulationMap::new(
            self.minimum_guaranteed_lifetime,
            self.granularity,
            self.num_shards,
            self.policy,
        ))
    }
}

impl<A: Accumulation> Default for MapBuilder<A> {
    fn default() -> Self {
        Self::new()
    }
}

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
    fn defaults_follow_window_config() {
        let map = MapBuilder::<Acc>::new().build().unwrap();
        let cfg = WindowConfig::default();
        assert_eq!(map.minimum_guaranteed_lifetime(), cfg.minimum_guaranteed_lifetime());
        assert_eq!(map.granularity(), cfg.granularity());
    }

    #[test]
    fn rejects_bad_shard_count() {
        let err = MapBuilder::<Acc>::new().num_shards(3).build().err();
        assert_eq!(err, Some(ConfigError::InvalidShardCount(3)));
        let err = MapBuilder::<Acc>::new().num_shards(0).build().err();
        assert_eq!(err, Some(ConfigError::InvalidShardCount(0)));
    }

    #[test]
    fn rejects_lifetime_below_granularity() {
        let err = MapBuilder::<Acc>::new()
            .minimum_guaranteed_lifetime(Duration::from_millis(10))
            .granularity(Duration::from_millis(100))
            .build()
            .err();
        assert!(matches!(err, Some(ConfigError::LifetimeShorterThanGranularity { .. })));
    }
}
