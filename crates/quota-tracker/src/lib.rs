//! Persistent, per-credential quota exhaustion tracking
//!
//! A credential that hits a period quota is recorded as exhausted until its
//! provider's next reset boundary. Records survive restarts through a single
//! JSON state file and are pruned once their boundary has passed.

pub mod boundary;
pub mod clock;
pub mod error;
pub mod store;
pub mod tracker;

pub use boundary::next_reset;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use store::{CACHE_DIR_ENV, CredentialRecord, STATE_FILE_NAME, StateFile, resolve_state_path};
pub use tracker::QuotaTracker;
