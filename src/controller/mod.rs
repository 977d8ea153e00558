//! Controller module for carbon-aware node power and workload eviction
//!
//! Each entity kind gets its own event reactor fed by a Kubernetes watch
//! stream. The node coordinator drives BMC power state; the workload
//! coordinator evicts running pods whose priority no longer fits.

pub mod cluster;
pub mod events;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod node;
pub mod workload;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::sync::watch;
use tracing::info;

pub use cluster::{ClusterActions, KubeCluster};
pub use events::{run_reactor, ClusterEvent, ClusterRecord, EntityKind, EventHandler};
pub use node::{plan_power, NodeCoordinator, NodeDecision, NodeRecord, NodeRegistry};
pub use workload::{EvictionDecision, WorkloadCoordinator, WorkloadPhase, WorkloadRecord};

/// Watch nodes and pods cluster-wide and drive both coordinators until
/// `shutdown` flips to true.
pub async fn run_controllers(
    client: Client,
    nodes: Arc<NodeCoordinator>,
    workloads: Arc<WorkloadCoordinator>,
    shutdown: watch::Receiver<bool>,
    resync: Duration,
) {
    let node_api: Api<Node> = Api::all(client.clone());
    let pod_api: Api<Pod> = Api::all(client);

    let node_events = watcher(node_api, watcher::Config::default()).default_backoff();
    let pod_events = watcher(pod_api, watcher::Config::default()).default_backoff();

    info!("Starting node and workload coordinators");

    tokio::join!(
        run_reactor(nodes, node_events, shutdown.clone(), Some(resync)),
        run_reactor(workloads, pod_events, shutdown, Some(resync)),
    );

    info!("Coordinators stopped");
}
