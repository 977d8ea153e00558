//! Carbon admission gate
//!
//! Answers synchronously whether a workload may enter placement under the
//! current carbon index. A rejection is a carbon-budget veto, so it must not
//! trigger preemption on the scheduler side.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::carbon_aware::{fits, CarbonSignal};
use crate::controller::WorkloadRecord;

/// Answer returned to the hosting scheduler
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    /// Terminal for this scheduling attempt; preemption cannot help
    RejectNoPreempt(String),
}

impl AdmissionDecision {
    pub fn is_admit(&self) -> bool {
        matches!(self, AdmissionDecision::Admit)
    }

    pub fn label(&self) -> &'static str {
        match self {
            AdmissionDecision::Admit => "admit",
            AdmissionDecision::RejectNoPreempt(_) => "reject",
        }
    }
}

pub struct AdmissionGate {
    carbon: Arc<dyn CarbonSignal>,
}

impl AdmissionGate {
    pub fn new(carbon: Arc<dyn CarbonSignal>) -> Self {
        Self { carbon }
    }

    /// Decide admission for one workload. Never fails: a carbon read error
    /// becomes a rejection carrying the reason.
    #[instrument(skip(self, workload), fields(workload = %workload))]
    pub async fn admit(&self, workload: &WorkloadRecord) -> AdmissionDecision {
        let decision = self.decide(workload).await;

        #[cfg(feature = "metrics")]
        crate::controller::metrics::inc_admission(decision.label());

        match &decision {
            AdmissionDecision::Admit => debug!("Admitting {}", workload),
            AdmissionDecision::RejectNoPreempt(reason) => {
                info!("Rejecting {}: {}", workload, reason)
            }
        }
        decision
    }

    async fn decide(&self, workload: &WorkloadRecord) -> AdmissionDecision {
        // No priority ranks above every carbon budget.
        let Some(priority) = workload.priority else {
            return AdmissionDecision::Admit;
        };

        let sample = match self.carbon.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Carbon index unavailable while admitting {}: {}", workload, e);
                return AdmissionDecision::RejectNoPreempt(format!(
                    "failed to read carbon index: {e}"
                ));
            }
        };

        if fits(priority, &sample) {
            AdmissionDecision::Admit
        } else {
            AdmissionDecision::RejectNoPreempt(format!(
                "priority {} is below carbon index {}",
                priority, sample.value
            ))
        }
    }
}
