//! Time-bucket bookkeeping that drives expiration.
//!
//! Each partition owns one [`TimeBucketedConnectionSet`]; the map consults it
//! on every observation and sweeps it whenever a new bucket opens.

pub mod bucket_set;
pub mod tombstone;

pub use bucket_set::{ConnectionBucket, TimeBucketedConnectionSet};
pub use tombstone::Tombstone;
