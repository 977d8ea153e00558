//! Node power coordinator
//!
//! Powers a node on when fitting demand is queued and off when nothing needs
//! it. Nodes without power-control annotations are ignored entirely.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use super::cluster::ClusterActions;
use super::events::{report_cycle_error, ClusterEvent, ClusterRecord, EntityKind, EventHandler};
use crate::carbon_aware::{fits, CarbonSample, CarbonSignal};
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::power::{with_session, PowerCommand, PowerController, PowerEndpoint, PowerState};

/// The parts of a node the power coordinator looks at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    /// `None` when the node is not power-managed
    pub power: Option<PowerEndpoint>,
    pub idle: bool,
}

impl NodeRecord {
    pub fn from_node(node: &Node) -> Self {
        let name = node.name_any();
        let power = PowerEndpoint::from_annotations(&name, node.annotations());
        Self {
            idle: is_idle(node),
            power,
            name,
        }
    }
}

/// A node is idle when its allocatable pod count equals its pod capacity.
/// Missing counts are treated as busy.
fn is_idle(node: &Node) -> bool {
    let Some(status) = node.status.as_ref() else {
        return false;
    };
    let allocatable = status.allocatable.as_ref().and_then(|a| a.get("pods"));
    let capacity = status.capacity.as_ref().and_then(|c| c.get("pods"));
    match (allocatable, capacity) {
        (Some(a), Some(c)) => a.0 == c.0,
        _ => false,
    }
}

impl ClusterRecord for NodeRecord {
    type Object = Node;

    const KIND: EntityKind = EntityKind::Node;

    fn from_object(obj: &Node) -> Self {
        Self::from_node(obj)
    }

    fn key(&self) -> String {
        self.name.clone()
    }
}

/// Power metadata of every node the coordinator has seen, keyed by node name
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<String, NodeRecord>>,
}

impl NodeRegistry {
    pub async fn upsert(&self, record: NodeRecord) {
        self.nodes.write().await.insert(record.name.clone(), record);
    }

    pub async fn remove(&self, name: &str) -> Option<NodeRecord> {
        self.nodes.write().await.remove(name)
    }

    pub async fn get(&self, name: &str) -> Option<NodeRecord> {
        self.nodes.read().await.get(name).cloned()
    }

    /// Power-managed nodes only
    pub async fn managed(&self) -> Vec<NodeRecord> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.power.is_some())
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

/// Decide which power command, if any, a node needs.
///
/// Power-on is demand driven and power-off is idleness gated. A busy node
/// with no fitting demand is left alone.
pub fn plan_power(demand: bool, idle: bool, current: PowerState) -> Option<PowerCommand> {
    match (demand, idle, current) {
        (true, _, PowerState::On) => None,
        (true, _, _) => Some(PowerCommand::On),
        (false, true, PowerState::Off) => None,
        (false, true, _) => Some(PowerCommand::Off),
        (false, false, _) => None,
    }
}

/// Outcome of one node cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeDecision {
    /// No power-control metadata
    Exempt,
    /// Not the leader; nothing evaluated
    Standby,
    NoAction { observed: PowerState },
    /// Command sent (or planned, in dry-run)
    Issued {
        command: PowerCommand,
        observed: PowerState,
    },
}

pub struct NodeCoordinator {
    carbon: Arc<dyn CarbonSignal>,
    power: Arc<dyn PowerController>,
    cluster: Arc<dyn ClusterActions>,
    config: ControllerConfig,
    registry: NodeRegistry,
    leader: Arc<AtomicBool>,
}

impl NodeCoordinator {
    pub fn new(
        carbon: Arc<dyn CarbonSignal>,
        power: Arc<dyn PowerController>,
        cluster: Arc<dyn ClusterActions>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            carbon,
            power,
            cluster,
            config,
            registry: NodeRegistry::default(),
            leader: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Only act while this flag is set (leader election)
    pub fn with_leader_flag(mut self, leader: Arc<AtomicBool>) -> Self {
        self.leader = leader;
        self
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Whether any queued workload fits under the sampled index
    async fn has_fitting_demand(&self, sample: &CarbonSample) -> Result<bool> {
        let pending = self.cluster.pending_workloads().await?;
        let demand = pending.iter().find(|w| {
            self.config.counts_as_demand(w.scheduler_name.as_deref())
                && w.priority.is_some_and(|p| fits(p, sample))
        });
        if let Some(w) = demand {
            debug!("{} fits under carbon index {}", w, sample.value);
        }
        Ok(demand.is_some())
    }

    /// Run one decision cycle for a node
    #[instrument(skip(self, node), fields(node = %node.name))]
    pub async fn reconcile_node(&self, node: &NodeRecord) -> Result<NodeDecision> {
        let Some(endpoint) = node.power.as_ref() else {
            debug!("Node {} has no power-control metadata, skipping", node.name);
            return Ok(NodeDecision::Exempt);
        };

        if !self.leader.load(Ordering::Relaxed) {
            debug!("Not leader, skipping power check for {}", node.name);
            return Ok(NodeDecision::Standby);
        }

        let sample = self.carbon.sample().await?;
        let demand = self.has_fitting_demand(&sample).await?;
        let idle = node.idle;

        info!(
            "Node {} carbon index {}, demand={}, idle={}",
            node.name, sample.value, demand, idle
        );

        let result = with_session(
            self.power.as_ref(),
            &node.name,
            endpoint,
            self.config.dry_run,
            |current| plan_power(demand, idle, current),
        )
        .await;

        #[cfg(feature = "metrics")]
        if let Err(e) = &result {
            super::metrics::inc_power_action("session", e.kind());
        }

        let outcome = result?;

        match outcome.issued {
            Some(command) => {
                if self.config.dry_run {
                    info!(
                        "Dry run: would power {} node {} (status {})",
                        command, node.name, outcome.observed
                    );
                } else {
                    info!(
                        "Powered {} node {} (was {})",
                        command, node.name, outcome.observed
                    );
                    #[cfg(feature = "metrics")]
                    super::metrics::inc_power_action(&command.to_string(), "ok");
                }
                Ok(NodeDecision::Issued {
                    command,
                    observed: outcome.observed,
                })
            }
            None => {
                debug!("Node {} stays {}", node.name, outcome.observed);
                Ok(NodeDecision::NoAction {
                    observed: outcome.observed,
                })
            }
        }
    }
}

#[async_trait]
impl EventHandler for NodeCoordinator {
    type Record = NodeRecord;

    async fn handle(&self, event: ClusterEvent<NodeRecord>) -> Result<()> {
        match event {
            ClusterEvent::Added(node) => {
                self.registry.upsert(node.clone()).await;
                self.reconcile_node(&node).await?;
            }
            ClusterEvent::Updated { old, new } => {
                self.registry.upsert(new.clone()).await;
                if old.power != new.power || old.idle != new.idle {
                    self.reconcile_node(&new).await?;
                }
            }
            ClusterEvent::Deleted(node) => {
                self.registry.remove(&node.name).await;
                info!("Node deleted: {}", node.name);
            }
        }
        Ok(())
    }

    async fn resync(&self) -> Result<()> {
        let nodes = self.registry.managed().await;
        debug!("Re-evaluating {} power-managed nodes", nodes.len());

        let results = join_all(nodes.iter().map(|n| self.reconcile_node(n))).await;
        for (node, result) in nodes.iter().zip(results) {
            if let Err(e) = result {
                report_cycle_error(EntityKind::Node, &node.name, &e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::power::types::{ENDPOINT_ANNOTATION, PASSWORD_ANNOTATION, USERNAME_ANNOTATION};

    fn node(name: &str, allocatable: Option<&str>, capacity: Option<&str>) -> Node {
        let pods = |v: Option<&str>| {
            v.map(|v| BTreeMap::from([("pods".to_string(), Quantity(v.to_string()))]))
        };
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                allocatable: pods(allocatable),
                capacity: pods(capacity),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_power_table() {
        use PowerCommand::*;
        use PowerState::{Off as IsOff, On as IsOn, Unknown};

        assert_eq!(plan_power(true, true, IsOff), Some(On));
        assert_eq!(plan_power(true, false, Unknown), Some(On));
        assert_eq!(plan_power(true, true, IsOn), None);
        assert_eq!(plan_power(false, true, IsOn), Some(Off));
        assert_eq!(plan_power(false, true, Unknown), Some(Off));
        assert_eq!(plan_power(false, true, IsOff), None);
        assert_eq!(plan_power(false, false, IsOn), None);
        assert_eq!(plan_power(false, false, IsOff), None);
    }

    #[test]
    fn test_never_powers_off_busy_node() {
        for demand in [true, false] {
            for state in [PowerState::On, PowerState::Off, PowerState::Unknown] {
                assert_ne!(plan_power(demand, false, state), Some(PowerCommand::Off));
            }
        }
    }

    #[test]
    fn test_never_powers_on_without_demand() {
        for idle in [true, false] {
            for state in [PowerState::On, PowerState::Off, PowerState::Unknown] {
                assert_ne!(plan_power(false, idle, state), Some(PowerCommand::On));
            }
        }
    }

    #[test]
    fn test_idle_requires_matching_pod_counts() {
        assert!(is_idle(&node("a", Some("110"), Some("110"))));
        assert!(!is_idle(&node("b", Some("100"), Some("110"))));
        assert!(!is_idle(&node("c", None, Some("110"))));
        assert!(!is_idle(&Node::default()));
    }

    #[test]
    fn test_record_reads_power_annotations() {
        let mut n = node("worker-1", Some("110"), Some("110"));
        assert!(NodeRecord::from_node(&n).power.is_none());

        n.metadata.annotations = Some(BTreeMap::from([
            (ENDPOINT_ANNOTATION.to_string(), "10.0.0.5".to_string()),
            (USERNAME_ANNOTATION.to_string(), "admin".to_string()),
            (PASSWORD_ANNOTATION.to_string(), "secret".to_string()),
        ]));
        let record = NodeRecord::from_node(&n);
        assert_eq!(record.key(), "worker-1");
        assert!(record.idle);
        assert_eq!(record.power.unwrap().host, "10.0.0.5");
    }

    #[tokio::test]
    async fn test_registry_tracks_managed_nodes() {
        let registry = NodeRegistry::default();
        registry
            .upsert(NodeRecord {
                name: "a".into(),
                power: Some(PowerEndpoint::new("h", "u", "p")),
                idle: true,
            })
            .await;
        registry
            .upsert(NodeRecord {
                name: "b".into(),
                power: None,
                idle: true,
            })
            .await;

        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.managed().await.len(), 1);
        assert!(registry.remove("a").await.is_some());
        assert!(registry.managed().await.is_empty());
        assert!(registry.get("b").await.is_some());
    }
}
