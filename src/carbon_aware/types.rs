//! Types for carbon-aware decisions

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Highest value the carbon index can take (dirtiest grid)
pub const MAX_CARBON_INDEX: i32 = 100;

/// A point-in-time carbon intensity reading on a 0-100 scale (higher is dirtier)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarbonSample {
    /// Index value, 0..=100
    pub value: i32,
    /// When the signal source observed the value
    pub observed_at: DateTime<Utc>,
}

impl CarbonSample {
    /// Build a sample, rejecting values outside the 0-100 index range
    pub fn new(value: i32, observed_at: DateTime<Utc>) -> Result<Self> {
        if !(0..=MAX_CARBON_INDEX).contains(&value) {
            return Err(Error::FetchError(format!(
                "carbon index {value} outside 0..={MAX_CARBON_INDEX}"
            )));
        }
        Ok(Self { value, observed_at })
    }

    /// Age of the sample relative to `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.observed_at)
    }
}

/// Whether a workload of the given priority fits under the current carbon budget
pub fn fits(priority: i32, sample: &CarbonSample) -> bool {
    priority >= sample.value
}

/// Bearer credential for the carbon signal service.
///
/// Never leaves the client that obtained it.
#[derive(Clone)]
pub struct Credential {
    pub(crate) token: String,
    pub(crate) obtained_at: DateTime<Utc>,
}

impl Credential {
    pub(crate) fn new(token: String) -> Self {
        Self {
            token,
            obtained_at: Utc::now(),
        }
    }

    /// Whether the credential is older than `ttl` at `now`
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        now.signed_duration_since(self.obtained_at) >= ttl
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

pub const DEFAULT_LOGIN_URL: &str = "https://api2.watttime.org/v2/login";
pub const DEFAULT_INDEX_URL: &str = "https://api2.watttime.org/index";

/// Connection settings for the carbon signal service
#[derive(Clone, Deserialize, Serialize)]
pub struct CarbonClientConfig {
    pub username: String,
    pub password: String,
    /// Balancing authority (grid region) code, e.g. "CAISO_NORTH"
    pub region: String,
    pub login_url: String,
    pub index_url: String,
    /// Timeout applied to every request
    pub timeout: Duration,
    /// Re-login once the cached token is this old
    pub token_ttl: Duration,
}

impl CarbonClientConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            region: region.into(),
            login_url: DEFAULT_LOGIN_URL.to_string(),
            index_url: DEFAULT_INDEX_URL.to_string(),
            timeout: Duration::from_secs(30),
            token_ttl: Duration::from_secs(30 * 60),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(Error::ConfigError(
                "carbon signal username and password are required".to_string(),
            ));
        }
        if self.region.is_empty() {
            return Err(Error::ConfigError(
                "carbon signal region (balancing authority) is required".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::ConfigError("HTTP timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CarbonClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CarbonClientConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("region", &self.region)
            .field("login_url", &self.login_url)
            .field("index_url", &self.index_url)
            .field("timeout", &self.timeout)
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}
