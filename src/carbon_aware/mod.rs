//! Carbon signal client
//!
//! Authenticates to the carbon intensity service, caches the bearer token and
//! fetches point-in-time index samples. Every decision point asks for a fresh
//! sample; nothing here retries on its own.

pub mod api;
pub mod types;

pub use api::{CarbonSignal, WattTimeClient};
pub use types::{fits, CarbonClientConfig, CarbonSample, Credential};
