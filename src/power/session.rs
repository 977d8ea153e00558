//! Power session traits and scoped session handling

use async_trait::async_trait;
use tracing::{debug, warn};

use super::types::{PowerCommand, PowerEndpoint, PowerOutcome, PowerState};
use crate::error::Result;

/// Opens sessions against node power controllers
#[async_trait]
pub trait PowerController: Send + Sync {
    async fn open(&self, node: &str, endpoint: &PowerEndpoint) -> Result<Box<dyn PowerSession>>;
}

/// An open session to one node's power controller
#[async_trait]
pub trait PowerSession: Send {
    async fn power_on(&mut self) -> Result<()>;
    async fn power_off(&mut self) -> Result<()>;
    async fn power_cycle(&mut self) -> Result<()>;
    async fn status(&mut self) -> Result<PowerState>;
    async fn close(self: Box<Self>) -> Result<()>;
}

async fn issue(session: &mut dyn PowerSession, command: PowerCommand) -> Result<()> {
    match command {
        PowerCommand::On => session.power_on().await,
        PowerCommand::Off => session.power_off().await,
        PowerCommand::Cycle => session.power_cycle().await,
    }
}

/// Open a session, read status, issue at most one command chosen by `plan`,
/// and close the session.
///
/// The session is closed exactly once on every path after a successful open,
/// including when reading status or issuing the command fails. When
/// `dry_run` is set the planned command is reported but not sent.
pub async fn with_session<F>(
    controller: &dyn PowerController,
    node: &str,
    endpoint: &PowerEndpoint,
    dry_run: bool,
    plan: F,
) -> Result<PowerOutcome>
where
    F: FnOnce(PowerState) -> Option<PowerCommand> + Send,
{
    let mut session = controller.open(node, endpoint).await?;

    let result = async {
        let observed = session.status().await?;
        let command = plan(observed);
        if let Some(command) = command {
            if dry_run {
                debug!(node, %command, "Dry run: skipping power command");
            } else {
                issue(session.as_mut(), command).await?;
            }
        }
        Ok(PowerOutcome {
            observed,
            issued: command,
        })
    }
    .await;

    release(session, node).await;
    result
}

/// Open a session, issue `command` unconditionally, read back status, close.
pub async fn run_command(
    controller: &dyn PowerController,
    node: &str,
    endpoint: &PowerEndpoint,
    command: PowerCommand,
) -> Result<PowerOutcome> {
    let mut session = controller.open(node, endpoint).await?;

    let result = async {
        issue(session.as_mut(), command).await?;
        let observed = session.status().await?;
        Ok(PowerOutcome {
            observed,
            issued: Some(command),
        })
    }
    .await;

    release(session, node).await;
    result
}

/// Open a session and only read status.
pub async fn read_status(
    controller: &dyn PowerController,
    node: &str,
    endpoint: &PowerEndpoint,
) -> Result<PowerState> {
    with_session(controller, node, endpoint, false, |_| None)
        .await
        .map(|outcome| outcome.observed)
}

async fn release(session: Box<dyn PowerSession>, node: &str) {
    if let Err(e) = session.close().await {
        warn!(node, "Failed to close power session: {}", e);
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory power controller that records every call

    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::Error;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Call {
        Open(String),
        On(String),
        Off(String),
        Cycle(String),
        Status(String),
        Close(String),
    }

    #[derive(Default)]
    struct Inner {
        states: BTreeMap<String, PowerState>,
        calls: Vec<Call>,
        fail_open: bool,
        fail_status: bool,
        fail_commands: bool,
    }

    /// Fake controller; powering on/off updates the stored state
    #[derive(Clone, Default)]
    pub struct FakePowerController {
        inner: Arc<Mutex<Inner>>,
    }

    impl FakePowerController {
        pub fn with_state(node: &str, state: PowerState) -> Self {
            let fake = Self::default();
            fake.set_state(node, state);
            fake
        }

        pub fn set_state(&self, node: &str, state: PowerState) {
            self.inner
                .lock()
                .unwrap()
                .states
                .insert(node.to_string(), state);
        }

        pub fn state(&self, node: &str) -> PowerState {
            self.inner
                .lock()
                .unwrap()
                .states
                .get(node)
                .copied()
                .unwrap_or(PowerState::Unknown)
        }

        pub fn fail_open(&self) {
            self.inner.lock().unwrap().fail_open = true;
        }

        pub fn fail_status(&self) {
            self.inner.lock().unwrap().fail_status = true;
        }

        pub fn fail_commands(&self) {
            self.inner.lock().unwrap().fail_commands = true;
        }

        pub fn calls(&self) -> Vec<Call> {
            self.inner.lock().unwrap().calls.clone()
        }

        pub fn opens(&self) -> usize {
            self.count(|c| matches!(c, Call::Open(_)))
        }

        pub fn closes(&self) -> usize {
            self.count(|c| matches!(c, Call::Close(_)))
        }

        pub fn commands(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|c| matches!(c, Call::On(_) | Call::Off(_) | Call::Cycle(_)))
                .collect()
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.inner.lock().unwrap().calls.iter().filter(|c| pred(*c)).count()
        }
    }

    #[async_trait]
    impl PowerController for FakePowerController {
        async fn open(
            &self,
            node: &str,
            _endpoint: &PowerEndpoint,
        ) -> Result<Box<dyn PowerSession>> {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(Call::Open(node.to_string()));
            if inner.fail_open {
                return Err(Error::ConnectError {
                    node: node.to_string(),
                    message: "connection refused".to_string(),
                });
            }
            Ok(Box::new(FakeSession {
                node: node.to_string(),
                inner: self.inner.clone(),
            }))
        }
    }

    struct FakeSession {
        node: String,
        inner: Arc<Mutex<Inner>>,
    }

    impl FakeSession {
        fn command(&self, call: Call, next: Option<PowerState>) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(call);
            if inner.fail_commands {
                return Err(Error::ActionError(format!(
                    "power command rejected by {}",
                    self.node
                )));
            }
            if let Some(state) = next {
                inner.states.insert(self.node.clone(), state);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PowerSession for FakeSession {
        async fn power_on(&mut self) -> Result<()> {
            self.command(Call::On(self.node.clone()), Some(PowerState::On))
        }

        async fn power_off(&mut self) -> Result<()> {
            self.command(Call::Off(self.node.clone()), Some(PowerState::Off))
        }

        async fn power_cycle(&mut self) -> Result<()> {
            self.command(Call::Cycle(self.node.clone()), Some(PowerState::On))
        }

        async fn status(&mut self) -> Result<PowerState> {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(Call::Status(self.node.clone()));
            if inner.fail_status {
                return Err(Error::StatusError {
                    node: self.node.clone(),
                    message: "no response".to_string(),
                });
            }
            Ok(inner
                .states
                .get(&self.node)
                .copied()
                .unwrap_or(PowerState::Unknown))
        }

        async fn close(self: Box<Self>) -> Result<()> {
            self.inner
                .lock()
                .unwrap()
                .calls
                .push(Call::Close(self.node.clone()));
            Ok(())
        }
    }
}
