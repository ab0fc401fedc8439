//! Window configuration, loadable from any serde format.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Timing parameters of an [`ExpiringAccumulationMap`](crate::ExpiringAccumulationMap).
///
/// Missing fields fall back to their defaults:
///
/// ```
/// let cfg: driftmap::WindowConfig = serde_json::from_str(r#"{"granularity_ms": 250}"#).unwrap();
/// assert_eq!(cfg.granularity_ms, 250);
/// assert_eq!(cfg.minimum_guaranteed_lifetime_ms, 30_000);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// How long an idle connection's accumulation stays queryable after its
    /// last observation, at minimum.
    pub minimum_guaranteed_lifetime_ms: u64,
    /// Width of one time bucket.
    pub granularity_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            minimum_guaranteed_lifetime_ms: 30_000,
            granularity_ms: 1_000,
        }
    }
}

impl WindowConfig {
    pub fn minimum_guaranteed_lifetime(&self) -> Duration {
        Duration::from_millis(self.minimum_guaranteed_lifetime_ms)
    }

    pub fn granularity(&self) -> Duration {
        Duration::from_millis(self.granularity_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_window(self.minimum_guaranteed_lifetime(), self.granularity())
    }
}

pub(crate) fn validate_window(lifetime: Duration, granularity: Duration) -> Result<(), ConfigError> {
    if granularity.as_millis() == 0 {
        return Err(ConfigError::ZeroGranularity);
    }
    if lifetime < granularity {
        return Err(ConfigError::LifetimeShorterThanGranularity {
            lifetime,
            granularity,
        });
    }
    Ok(())
}
