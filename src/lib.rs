mod accumulation;
mod anomaly;
mod builder;
mod config;
mod error;
mod key;
mod map;
mod metrics;
mod time;
pub mod expiry;
pub mod store;

pub use accumulation::Accumulation;
pub use anomaly::{AnomalyPolicy, DefaultPolicy, MAX_RACE_RETRIES};
pub use builder::MapBuilder;
pub use config::WindowConfig;
pub use error::ConfigError;
pub use key::ConnectionKey;
pub use map::ExpiringAccumulationMap;
pub use metrics::stats::Metrics;
pub use time::{epoch_millis, NewestTimestamp, TimeBucketKey};
