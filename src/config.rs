//! Validated runtime configuration for the coordinators and the extender

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Settings shared by the node and workload coordinators
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Compute and log decisions without powering nodes or evicting pods
    pub dry_run: bool,
    /// Only pending pods handled by this scheduler count as demand
    pub scheduler_name: Option<String>,
    /// How often every power-managed node is re-evaluated
    pub resync_interval: Duration,
    /// Timeout for a single power-control command
    pub power_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            scheduler_name: None,
            resync_interval: Duration::from_secs(300),
            power_timeout: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.resync_interval.is_zero() {
            return Err(Error::ConfigError(
                "resync interval must be non-zero".to_string(),
            ));
        }
        if self.power_timeout.is_zero() {
            return Err(Error::ConfigError(
                "power command timeout must be non-zero".to_string(),
            ));
        }
        if matches!(self.scheduler_name.as_deref(), Some(name) if name.trim().is_empty()) {
            return Err(Error::ConfigError(
                "scheduler name filter must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a pending pod with this scheduler name counts as demand
    pub fn counts_as_demand(&self, scheduler_name: Option<&str>) -> bool {
        match self.scheduler_name.as_deref() {
            None => true,
            Some(wanted) => scheduler_name == Some(wanted),
        }
    }
}

/// Settings for the scheduler extender HTTP server
#[derive(Clone, Debug)]
pub struct ExtenderConfig {
    pub addr: SocketAddr,
}

impl Default for ExtenderConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8888)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_durations() {
        let config = ControllerConfig {
            resync_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let config = ControllerConfig {
            power_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_blank_scheduler_name() {
        let config = ControllerConfig {
            scheduler_name: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scheduler_name_filter() {
        let open = ControllerConfig::default();
        assert!(open.counts_as_demand(None));
        assert!(open.counts_as_demand(Some("default-scheduler")));

        let filtered = ControllerConfig {
            scheduler_name: Some("emissions-scheduler".to_string()),
            ..Default::default()
        };
        assert!(filtered.counts_as_demand(Some("emissions-scheduler")));
        assert!(!filtered.counts_as_demand(Some("default-scheduler")));
        assert!(!filtered.counts_as_demand(None));
    }
}
