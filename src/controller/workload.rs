//! Workload eviction coordinator
//!
//! Re-checks running workloads against the carbon index whenever they appear,
//! start running or change priority, and evicts the ones that no longer fit.
//! Running workloads with a priority are remembered so the periodic resync
//! can re-check them after the index moves or this replica becomes leader.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use super::cluster::ClusterActions;
use super::events::{report_cycle_error, ClusterEvent, ClusterRecord, EntityKind, EventHandler};
use crate::carbon_aware::{fits, CarbonSignal};
use crate::config::ControllerConfig;
use crate::error::Result;

/// Lifecycle phase relevant to carbon decisions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Other,
}

impl WorkloadPhase {
    pub fn from_pod_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => WorkloadPhase::Pending,
            Some("Running") => WorkloadPhase::Running,
            _ => WorkloadPhase::Other,
        }
    }
}

/// The parts of a pod the coordinators look at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadRecord {
    pub namespace: String,
    pub name: String,
    /// Absent priority exempts the workload from carbon decisions
    pub priority: Option<i32>,
    pub phase: WorkloadPhase,
    pub scheduler_name: Option<String>,
}

impl WorkloadRecord {
    pub fn from_pod(pod: &Pod) -> Self {
        let spec = pod.spec.as_ref();
        Self {
            namespace: pod.namespace().unwrap_or_else(|| "default".to_string()),
            name: pod.name_any(),
            priority: spec.and_then(|s| s.priority),
            phase: WorkloadPhase::from_pod_phase(
                pod.status.as_ref().and_then(|s| s.phase.as_deref()),
            ),
            scheduler_name: spec.and_then(|s| s.scheduler_name.clone()),
        }
    }
}

impl std::fmt::Display for WorkloadRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl ClusterRecord for WorkloadRecord {
    type Object = Pod;

    const KIND: EntityKind = EntityKind::Workload;

    fn from_object(obj: &Pod) -> Self {
        Self::from_pod(obj)
    }

    fn key(&self) -> String {
        self.to_string()
    }
}

/// Outcome of one eviction cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvictionDecision {
    /// No priority set; carbon decisions do not apply
    Exempt,
    /// Not the leader; nothing evaluated
    Standby,
    /// Pending or finished; eviction does not apply
    NotRunning { index: i32 },
    /// Running and still fits under the index
    Retained { index: i32 },
    /// Eviction was requested (or would have been, in dry-run)
    Evicted { index: i32 },
}

pub struct WorkloadCoordinator {
    carbon: Arc<dyn CarbonSignal>,
    cluster: Arc<dyn ClusterActions>,
    config: ControllerConfig,
    /// Running workloads with a priority, keyed by `namespace/name`
    running: RwLock<BTreeMap<String, WorkloadRecord>>,
    leader: Arc<AtomicBool>,
}

impl WorkloadCoordinator {
    pub fn new(
        carbon: Arc<dyn CarbonSignal>,
        cluster: Arc<dyn ClusterActions>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            carbon,
            cluster,
            config,
            running: RwLock::new(BTreeMap::new()),
            leader: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Only act while this flag is set (leader election)
    pub fn with_leader_flag(mut self, leader: Arc<AtomicBool>) -> Self {
        self.leader = leader;
        self
    }

    /// Workloads the resync will re-check
    pub async fn tracked(&self) -> Vec<WorkloadRecord> {
        self.running.read().await.values().cloned().collect()
    }

    async fn track(&self, workload: &WorkloadRecord) {
        let mut running = self.running.write().await;
        if workload.priority.is_some() && workload.phase == WorkloadPhase::Running {
            running.insert(workload.key(), workload.clone());
        } else {
            running.remove(&workload.key());
        }
    }

    /// Decide whether a workload keeps its place under the current carbon index
    #[instrument(skip(self, workload), fields(workload = %workload))]
    pub async fn reconcile_workload(&self, workload: &WorkloadRecord) -> Result<EvictionDecision> {
        let Some(priority) = workload.priority else {
            debug!("Priority not set on {}, exempt from carbon eviction", workload);
            return Ok(EvictionDecision::Exempt);
        };

        if !self.leader.load(Ordering::Relaxed) {
            debug!("Not leader, skipping eviction check for {}", workload);
            return Ok(EvictionDecision::Standby);
        }

        let sample = self.carbon.sample().await?;

        info!(
            "Workload {} priority is {}, carbon index is {}",
            workload, priority, sample.value
        );

        // Pending workloads hold no resources yet; they wait in the queue instead.
        if workload.phase != WorkloadPhase::Running {
            debug!("{} is {:?}, not a candidate for eviction", workload, workload.phase);
            return Ok(EvictionDecision::NotRunning {
                index: sample.value,
            });
        }

        if fits(priority, &sample) {
            return Ok(EvictionDecision::Retained {
                index: sample.value,
            });
        }

        if self.config.dry_run {
            info!(
                "Dry run: would evict {} (priority {} < index {})",
                workload, priority, sample.value
            );
        } else {
            let result = self.cluster.evict(&workload.namespace, &workload.name).await;

            #[cfg(feature = "metrics")]
            super::metrics::inc_eviction(result.is_ok());

            result?;
            info!(
                "Evicted {} (priority {} < index {})",
                workload, priority, sample.value
            );
        }

        Ok(EvictionDecision::Evicted {
            index: sample.value,
        })
    }
}

#[async_trait]
impl EventHandler for WorkloadCoordinator {
    type Record = WorkloadRecord;

    async fn handle(&self, event: ClusterEvent<WorkloadRecord>) -> Result<()> {
        match event {
            ClusterEvent::Added(workload) => {
                self.track(&workload).await;
                self.reconcile_workload(&workload).await?;
            }
            ClusterEvent::Updated { old, new } => {
                self.track(&new).await;
                let started = old.phase != WorkloadPhase::Running
                    && new.phase == WorkloadPhase::Running;
                if old.priority != new.priority || started {
                    self.reconcile_workload(&new).await?;
                }
            }
            ClusterEvent::Deleted(workload) => {
                self.running.write().await.remove(&workload.key());
                info!("Workload deleted: {}", workload);
            }
        }
        Ok(())
    }

    async fn resync(&self) -> Result<()> {
        let workloads = self.tracked().await;
        debug!("Re-evaluating {} running workloads", workloads.len());

        let results = join_all(workloads.iter().map(|w| self.reconcile_workload(w))).await;
        for (workload, result) in workloads.iter().zip(results) {
            if let Err(e) = result {
                report_cycle_error(EntityKind::Workload, &workload.key(), &e);
            }
        }
        Ok(())
    }
}
