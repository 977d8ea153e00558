//! Carbon intensity API integration (WattTime)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::carbon_aware::types::{CarbonClientConfig, CarbonSample, Credential};
use crate::error::{Error, Result};

/// Source of carbon samples used by every decision point
#[async_trait]
pub trait CarbonSignal: Send + Sync {
    /// Fetch a fresh sample for the configured region
    async fn sample(&self) -> Result<CarbonSample>;
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: String,
}

/// Client for the WattTime carbon intensity service
pub struct WattTimeClient {
    client: Client,
    config: CarbonClientConfig,
    credential: RwLock<Option<Credential>>,
    /// Held while logging in so concurrent cold callers share one login
    login: Mutex<()>,
}

impl WattTimeClient {
    /// Create a new client; all requests use the configured timeout
    pub fn new(config: CarbonClientConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            credential: RwLock::new(None),
            login: Mutex::new(()),
        })
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    /// Log in with basic credentials and return a bearer credential
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Credential> {
        let response = self
            .client
            .get(&self.config.login_url)
            .basic_auth(username, Some(password))
            .send()
            .await
            .map_err(|e| Error::AuthError {
                status: None,
                body: format!("login request failed: {e}"),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_else(|e| {
            warn!("Failed to read login response body: {}", e);
            String::new()
        });

        if status != StatusCode::OK {
            return Err(Error::AuthError {
                status: Some(status.as_u16()),
                body,
            });
        }

        let login: LoginResponse = serde_json::from_str(&body).map_err(|e| Error::AuthError {
            status: Some(status.as_u16()),
            body: format!("malformed login response ({e}): {body}"),
        })?;

        if login.token.is_empty() {
            return Err(Error::AuthError {
                status: Some(status.as_u16()),
                body: format!("login response carried no token: {body}"),
            });
        }

        debug!("Obtained carbon signal token for user {}", username);
        Ok(Credential::new(login.token))
    }

    /// Fetch the current index for a balancing authority
    pub async fn fetch_index(&self, region: &str, credential: &Credential) -> Result<CarbonSample> {
        let response = self
            .client
            .get(&self.config.index_url)
            .query(&[("ba", region), ("style", "percent")])
            .bearer_auth(&credential.token)
            .send()
            .await
            .map_err(|e| Error::FetchError(format!("index request failed: {e}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_else(|e| {
            warn!("Failed to read index response body: {}", e);
            String::new()
        });

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::AuthError {
                status: Some(status.as_u16()),
                body,
            });
        }

        if !status.is_success() {
            return Err(Error::FetchError(format!(
                "index request returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        parse_index_body(&body)
    }

    /// Return the cached credential, logging in again when absent or expired
    async fn current_credential(&self) -> Result<Credential> {
        if let Some(cred) = self.cached_credential().await {
            return Ok(cred);
        }

        let _login = self.login.lock().await;
        // Another caller may have logged in while we waited
        if let Some(cred) = self.cached_credential().await {
            return Ok(cred);
        }

        let cred = self
            .authenticate(&self.config.username, &self.config.password)
            .await?;
        *self.credential.write().await = Some(cred.clone());
        info!("Authenticated to carbon signal service");
        Ok(cred)
    }

    async fn cached_credential(&self) -> Option<Credential> {
        let cached = self.credential.read().await;
        let cred = cached.as_ref()?;
        if cred.is_expired(self.config.token_ttl, Utc::now()) {
            debug!("Cached carbon signal token expired, logging in again");
            return None;
        }
        Some(cred.clone())
    }

    /// Drop the cached credential if it is still the one that was rejected
    async fn invalidate_credential(&self, rejected: &Credential) {
        let mut cached = self.credential.write().await;
        if cached.as_ref().is_some_and(|c| c.token == rejected.token) {
            *cached = None;
        }
    }
}

#[async_trait]
impl CarbonSignal for WattTimeClient {
    async fn sample(&self) -> Result<CarbonSample> {
        let result = match self.current_credential().await {
            Ok(cred) => {
                let result = self.fetch_index(&self.config.region, &cred).await;
                if let Err(Error::AuthError { .. }) = &result {
                    self.invalidate_credential(&cred).await;
                }
                result
            }
            Err(e) => Err(e),
        };

        #[cfg(feature = "metrics")]
        crate::controller::metrics::record_carbon_fetch(result.as_ref().ok());

        if let Ok(sample) = &result {
            debug!(
                region = %self.config.region,
                index = sample.value,
                age_secs = sample.age(Utc::now()).num_seconds(),
                "Fetched carbon index"
            );
        }
        result
    }
}

/// Parse `{"percent": "57", "point_time": "..."}` into a sample
fn parse_index_body(body: &str) -> Result<CarbonSample> {
    let json: Value = serde_json::from_str(body)
        .map_err(|e| Error::FetchError(format!("malformed index response ({e}): {body}")))?;

    let percent = match json.get("percent") {
        Some(Value::String(s)) => s.trim().parse::<i32>().map_err(|e| {
            Error::FetchError(format!("percent {s:?} is not an integer: {e}"))
        })?,
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| Error::FetchError(format!("percent {n} is not an integer")))?,
        Some(other) => {
            return Err(Error::FetchError(format!(
                "percent has unexpected type: {other}"
            )))
        }
        None => {
            return Err(Error::FetchError(format!(
                "index response has no percent field: {body}"
            )))
        }
    };

    let observed_at = json
        .get("point_time")
        .and_then(|t| t.as_str())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    CarbonSample::new(percent, observed_at)
}
