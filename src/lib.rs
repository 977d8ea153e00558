//! emissions-scheduler: carbon-aware node power and workload admission for Kubernetes
//!
//! One external carbon intensity index drives three decisions: powering
//! bare-metal nodes on and off through their BMCs, evicting running pods
//! whose priority no longer fits, and vetoing new pods at scheduling time
//! through a kube-scheduler extender.

pub mod carbon_aware;
pub mod config;
pub mod controller;
pub mod error;
pub mod power;
pub mod scheduler;
pub mod telemetry;

pub use crate::error::{Error, Result};
