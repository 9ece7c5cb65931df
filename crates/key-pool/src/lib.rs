//! Credential pool for one provider
//!
//! Holds a provider's credentials in priority order (primary first, then
//! backups) and hands out the first one the quota tracker reports available.
//! The pool keeps no rotation cursor: every selection re-scans from the top,
//! so a credential whose reset boundary passes is picked up on the very next
//! call.
//!
//! The only state the pool owns is the set of credentials disabled for this
//! process after the provider rejected them outright (401/403). That set is
//! never persisted.

pub mod error;
pub mod pool;

pub use error::{Error, Result};
pub use pool::{CredentialPool, CredentialStatus};
