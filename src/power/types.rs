//! Power-control endpoint and state types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_POWER_PORT: u16 = 623;
pub const DEFAULT_POWER_INTERFACE: &str = "lanplus";

pub const ENDPOINT_ANNOTATION: &str = "bmc.emissions.dev/endpoint";
pub const USERNAME_ANNOTATION: &str = "bmc.emissions.dev/username";
pub const PASSWORD_ANNOTATION: &str = "bmc.emissions.dev/password";
pub const PORT_ANNOTATION: &str = "bmc.emissions.dev/port";
pub const INTERFACE_ANNOTATION: &str = "bmc.emissions.dev/interface";

/// Address and credentials of a node's power controller (BMC)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub interface: String,
}

impl PowerEndpoint {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_POWER_PORT,
            username: username.into(),
            password: password.into(),
            interface: DEFAULT_POWER_INTERFACE.to_string(),
        }
    }

    /// Read power-control settings from node annotations.
    ///
    /// Endpoint, username and password are all required; port and interface
    /// fall back to 623 and "lanplus". Returns `None` when the node is not
    /// power-managed.
    pub fn from_annotations(node: &str, annotations: &BTreeMap<String, String>) -> Option<Self> {
        let host = non_empty(annotations.get(ENDPOINT_ANNOTATION))?;
        let username = non_empty(annotations.get(USERNAME_ANNOTATION))?;
        let password = non_empty(annotations.get(PASSWORD_ANNOTATION))?;

        let port = match non_empty(annotations.get(PORT_ANNOTATION)) {
            None => DEFAULT_POWER_PORT,
            Some(raw) => match raw.parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    warn!(
                        "Node {} has invalid {} annotation {:?}, ignoring power metadata",
                        node, PORT_ANNOTATION, raw
                    );
                    return None;
                }
            },
        };

        let interface = non_empty(annotations.get(INTERFACE_ANNOTATION))
            .unwrap_or(DEFAULT_POWER_INTERFACE)
            .to_string();

        Some(Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
            interface,
        })
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

impl std::fmt::Debug for PowerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("interface", &self.interface)
            .finish()
    }
}

/// Chassis power state as last read from the hardware
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
            PowerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// A single chassis power command
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerCommand {
    On,
    Off,
    Cycle,
}

impl std::fmt::Display for PowerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerCommand::On => write!(f, "on"),
            PowerCommand::Off => write!(f, "off"),
            PowerCommand::Cycle => write!(f, "cycle"),
        }
    }
}

impl std::str::FromStr for PowerCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on" => Ok(PowerCommand::On),
            "off" => Ok(PowerCommand::Off),
            "cycle" => Ok(PowerCommand::Cycle),
            other => Err(format!("unknown power command {other:?}")),
        }
    }
}

/// What a power session observed and did during one decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowerOutcome {
    pub observed: PowerState,
    pub issued: Option<PowerCommand>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_endpoint_defaults() {
        let ann = annotations(&[
            (ENDPOINT_ANNOTATION, "10.0.0.5"),
            (USERNAME_ANNOTATION, "admin"),
            (PASSWORD_ANNOTATION, "secret"),
        ]);
        let ep = PowerEndpoint::from_annotations("worker-1", &ann).unwrap();
        assert_eq!(ep.host, "10.0.0.5");
        assert_eq!(ep.port, 623);
        assert_eq!(ep.interface, "lanplus");
    }

    #[test]
    fn test_endpoint_overrides() {
        let ann = annotations(&[
            (ENDPOINT_ANNOTATION, "bmc.example"),
            (USERNAME_ANNOTATION, "admin"),
            (PASSWORD_ANNOTATION, "secret"),
            (PORT_ANNOTATION, "6230"),
            (INTERFACE_ANNOTATION, "lan"),
        ]);
        let ep = PowerEndpoint::from_annotations("worker-1", &ann).unwrap();
        assert_eq!(ep.port, 6230);
        assert_eq!(ep.interface, "lan");
    }

    #[test]
    fn test_endpoint_requires_all_credentials() {
        let ann = annotations(&[
            (ENDPOINT_ANNOTATION, "10.0.0.5"),
            (USERNAME_ANNOTATION, "admin"),
        ]);
        assert!(PowerEndpoint::from_annotations("worker-1", &ann).is_none());
        assert!(PowerEndpoint::from_annotations("worker-1", &BTreeMap::new()).is_none());

        let ann = annotations(&[
            (ENDPOINT_ANNOTATION, "  "),
            (USERNAME_ANNOTATION, "admin"),
            (PASSWORD_ANNOTATION, "secret"),
        ]);
        assert!(PowerEndpoint::from_annotations("worker-1", &ann).is_none());
    }

    #[test]
    fn test_endpoint_invalid_port() {
        let ann = annotations(&[
            (ENDPOINT_ANNOTATION, "10.0.0.5"),
            (USERNAME_ANNOTATION, "admin"),
            (PASSWORD_ANNOTATION, "secret"),
            (PORT_ANNOTATION, "not-a-port"),
        ]);
        assert!(PowerEndpoint::from_annotations("worker-1", &ann).is_none());
    }

    #[test]
    fn test_endpoint_debug_redacts_password() {
        let ep = PowerEndpoint::new("10.0.0.5", "admin", "secret");
        assert!(!format!("{ep:?}").contains("secret"));
    }

    #[test]
    fn test_power_command_parse() {
        assert_eq!("on".parse::<PowerCommand>(), Ok(PowerCommand::On));
        assert_eq!("OFF".parse::<PowerCommand>(), Ok(PowerCommand::Off));
        assert_eq!("cycle".parse::<PowerCommand>(), Ok(PowerCommand::Cycle));
        assert!("reboot".parse::<PowerCommand>().is_err());
    }
}
