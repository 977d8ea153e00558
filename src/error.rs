//! Error types for the emissions scheduler
//!
//! Every external call made during a decision cycle maps onto one of these
//! variants. Coordinators catch them at the cycle boundary; only the admission
//! gate turns them into an answer for its caller.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Login to the carbon signal service failed or the token was rejected
    #[error("carbon signal authentication failed (status {status:?}): {body}")]
    AuthError { status: Option<u16>, body: String },

    /// Carbon sample could not be fetched or parsed
    #[error("carbon signal fetch failed: {0}")]
    FetchError(String),

    /// Power-control session could not be established
    #[error("failed to open power session for node {node}: {message}")]
    ConnectError { node: String, message: String },

    /// Power state could not be read
    #[error("failed to read power status of node {node}: {message}")]
    StatusError { node: String, message: String },

    /// A power command or an eviction failed
    #[error("action failed: {0}")]
    ActionError(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Extender server error: {0}")]
    ServerError(String),
}

impl Error {
    /// Short, stable label used for log fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AuthError { .. } => "auth",
            Error::FetchError(_) => "fetch",
            Error::ConnectError { .. } => "connect",
            Error::StatusError { .. } => "status",
            Error::ActionError(_) => "action",
            Error::KubeError(_) => "kube",
            Error::HttpError(_) => "http",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ServerError(_) => "server",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_keeps_status_and_body() {
        let err = Error::AuthError {
            status: Some(403),
            body: "invalid credentials".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("403"));
        assert!(msg.contains("invalid credentials"));
        assert_eq!(err.kind(), "auth");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::FetchError("x".into()).kind(), "fetch");
        assert_eq!(
            Error::ConnectError {
                node: "n1".into(),
                message: "timeout".into()
            }
            .kind(),
            "connect"
        );
        assert_eq!(Error::ConfigError("x".into()).kind(), "config");
    }
}
