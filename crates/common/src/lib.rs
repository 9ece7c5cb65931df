//! Common types for the LLM request gateway

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
