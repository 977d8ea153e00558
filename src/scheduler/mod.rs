//! Admission gate and its kube-scheduler extender surface

pub mod extender;
pub mod gate;
pub mod server;

pub use extender::{ExtenderArgs, ExtenderFilterResult, NodeItems};
pub use gate::{AdmissionDecision, AdmissionGate};
pub use server::{router, serve};
