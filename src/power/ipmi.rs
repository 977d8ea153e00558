//! IPMI power control through the `ipmitool` binary
//!
//! Each `ipmitool` invocation negotiates its own RMCP+ session with the BMC;
//! the [`IpmiSession`] handle ties those invocations to one decision and
//! refuses further use once closed.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::session::{PowerController, PowerSession};
use super::types::{PowerEndpoint, PowerState};
use crate::error::{Error, Result};

const DEFAULT_IPMITOOL: &str = "ipmitool";

/// Opens IPMI sessions by shelling out to `ipmitool`
#[derive(Clone, Debug)]
pub struct IpmiToolController {
    binary: String,
    timeout: Duration,
}

impl IpmiToolController {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: DEFAULT_IPMITOOL.to_string(),
            timeout,
        }
    }

    /// Use a different `ipmitool` binary (path or name)
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

#[async_trait]
impl PowerController for IpmiToolController {
    #[instrument(skip(self, endpoint), fields(host = %endpoint.host, port = endpoint.port))]
    async fn open(&self, node: &str, endpoint: &PowerEndpoint) -> Result<Box<dyn PowerSession>> {
        let session = IpmiSession {
            node: node.to_string(),
            endpoint: endpoint.clone(),
            binary: self.binary.clone(),
            timeout: self.timeout,
            closed: false,
        };

        // Get Device ID: proves the BMC is reachable and accepts the credentials.
        session
            .run(&["mc", "info"])
            .await
            .map_err(|message| Error::ConnectError {
                node: node.to_string(),
                message,
            })?;

        debug!(node, "Opened IPMI session");
        Ok(Box::new(session))
    }
}

/// One node's IPMI session
pub struct IpmiSession {
    node: String,
    endpoint: PowerEndpoint,
    binary: String,
    timeout: Duration,
    closed: bool,
}

impl IpmiSession {
    fn base_args(&self) -> Vec<String> {
        vec![
            "-I".to_string(),
            self.endpoint.interface.clone(),
            "-H".to_string(),
            self.endpoint.host.clone(),
            "-p".to_string(),
            self.endpoint.port.to_string(),
            "-U".to_string(),
            self.endpoint.username.clone(),
            // -E reads the password from IPMI_PASSWORD so it stays out of argv
            "-E".to_string(),
        ]
    }

    /// Run one ipmitool command and return stdout, or an error message
    async fn run(&self, args: &[&str]) -> std::result::Result<String, String> {
        if self.closed {
            return Err("session already closed".to_string());
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.base_args())
            .args(args)
            .env("IPMI_PASSWORD", &self.endpoint.password)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => {
                return Err(format!(
                    "ipmitool {} timed out after {:?}",
                    args.join(" "),
                    self.timeout
                ))
            }
            Ok(Err(e)) => return Err(format!("failed to run {}: {e}", self.binary)),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "ipmitool {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn chassis_power(&self, action: &str) -> Result<()> {
        self.run(&["chassis", "power", action])
            .await
            .map(|_| ())
            .map_err(|e| Error::ActionError(format!("power {action} on node {}: {e}", self.node)))
    }
}

#[async_trait]
impl PowerSession for IpmiSession {
    async fn power_on(&mut self) -> Result<()> {
        self.chassis_power("on").await
    }

    async fn power_off(&mut self) -> Result<()> {
        self.chassis_power("off").await
    }

    async fn power_cycle(&mut self) -> Result<()> {
        self.chassis_power("cycle").await
    }

    async fn status(&mut self) -> Result<PowerState> {
        let stdout = self
            .run(&["chassis", "power", "status"])
            .await
            .map_err(|message| Error::StatusError {
                node: self.node.clone(),
                message,
            })?;

        parse_power_status(&stdout).ok_or_else(|| Error::StatusError {
            node: self.node.clone(),
            message: format!("unrecognised chassis status output: {}", stdout.trim()),
        })
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.closed = true;
        debug!(node = %self.node, "Closed IPMI session");
        Ok(())
    }
}

/// Parse `ipmitool chassis power status` output ("Chassis Power is on")
fn parse_power_status(stdout: &str) -> Option<PowerState> {
    let line = stdout.trim().to_ascii_lowercase();
    let state = line.strip_prefix("chassis power is")?.trim();
    match state {
        "on" => Some(PowerState::On),
        "off" => Some(PowerState::Off),
        _ => None,
    }
}
