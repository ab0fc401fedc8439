//! The contract a per-connection accumulation must meet to be tracked.
//!
//! The map never looks inside an accumulation.  It only needs the newest
//! observed timestamp (to place the connection in a time bucket and decide
//! whether it may be evicted) and a hook to call once it is evicted.
//!
//! # Example
//! ```
//! use driftmap::{Accumulation, NewestTimestamp};
//! use std::sync::Mutex;
//!
//! struct Reassembly {
//!     newest: NewestTimestamp,
//!     bytes: Mutex<Vec<u8>>,
//! }
//!
//! impl Accumulation for Reassembly {
//!     fn newest_timestamp(&self) -> &NewestTimestamp {
//!         &self.newest
//!     }
//!
//!     fn expire(&self) {
//!         self.bytes.lock().unwrap().clear();
//!     }
//! }
//! ```

use crate::time::NewestTimestamp;

pub trait Accumulation: Send + Sync + 'static {
    /// The cell holding the newest observed timestamp.
    fn newest_timestamp(&self) -> &NewestTimestamp;

    /// Called exactly once when a sweep evicts this accumulation.
    ///
    /// Not called on explicit removal; the caller owns that path.
    fn expire(&self) {}
}
