//! Multi-provider LLM request gateway
//!
//! A call names a provider and model (or takes the configured defaults) and
//! either comes back with text or with a report of every attempt made. In
//! between, the gateway retries transient failures with exponential backoff,
//! rotates through a provider's credentials as their quotas run out, and
//! switches to the fallback provider once the requested one has nothing left.
//!
//! - [`machine`]: pure retry/rotation/fallback state machine
//! - [`Gateway`]: the façade that wires pools, quota state and the HTTP client
//! - [`Config`]: TOML configuration

pub mod backoff;
pub mod config;
pub mod error;
pub mod gateway;
pub mod machine;
pub mod metrics;
mod orchestrator;

pub use config::{Config, TaskConfig};
pub use error::{AttemptRecord, GatewayError, Result};
pub use gateway::{Gateway, GatewayDefaults, SendRequest};
pub use machine::{CallAction, CallEvent, CallPolicy, CallState, Target};
pub use orchestrator::Completion;
