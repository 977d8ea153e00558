//! Power session manager
//!
//! Short-lived sessions to a node's power controller (BMC). Sessions are
//! opened per decision and always released through [`session::with_session`]
//! or [`session::run_command`].

pub mod ipmi;
pub mod session;
pub mod types;

pub use ipmi::IpmiToolController;
pub use session::{read_status, run_command, with_session, PowerController, PowerSession};
pub use types::{PowerCommand, PowerEndpoint, PowerOutcome, PowerState};
