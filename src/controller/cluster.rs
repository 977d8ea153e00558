//! Cluster action API: the reads and writes the coordinators make against
//! Kubernetes

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, EvictParams, ListParams},
    Client,
};
use tracing::{debug, info};

use super::workload::WorkloadRecord;
use crate::error::{Error, Result};

#[async_trait]
pub trait ClusterActions: Send + Sync {
    /// All workloads currently waiting to be scheduled
    async fn pending_workloads(&self) -> Result<Vec<WorkloadRecord>>;

    /// Request eviction of a workload; evicting a workload that is already
    /// gone succeeds
    async fn evict(&self, namespace: &str, name: &str) -> Result<()>;
}

/// `ClusterActions` backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterActions for KubeCluster {
    async fn pending_workloads(&self) -> Result<Vec<WorkloadRecord>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields("status.phase=Pending");
        let list = pods.list(&lp).await.map_err(Error::KubeError)?;
        debug!("Found {} pending pods", list.items.len());
        Ok(list.items.iter().map(WorkloadRecord::from_pod).collect())
    }

    async fn evict(&self, namespace: &str, name: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match pods.evict(name, &EvictParams::default()).await {
            Ok(_) => {
                info!("Evicted pod {}/{}", namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                debug!("Pod {}/{} already gone, nothing to evict", namespace, name);
                Ok(())
            }
            Err(e) => Err(Error::ActionError(format!(
                "failed to evict pod {namespace}/{name}: {e}"
            ))),
        }
    }
}
