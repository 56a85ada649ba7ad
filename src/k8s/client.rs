use super::directory::ClusterDirectory;
use super::types::{count_workloads, WorkloadInventory, WorkloadRef};
use crate::{NetInsightError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::ListParams;
use kube::{Api, Client};
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Kubernetes API backed directory
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    pub async fn try_default() -> Result<Self> {
        debug!("Initializing Kubernetes client");

        let client = Client::try_default().await.map_err(|e| {
            NetInsightError::KubernetesError(format!("Failed to create K8s client: {}", e))
        })?;

        info!("Successfully connected to Kubernetes cluster");

        Ok(Self { client })
    }

    fn pods_all(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    fn services_all(&self) -> Api<Service> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterDirectory for K8sClient {
    async fn find_pod_by_address(&self, address: Ipv4Addr) -> Result<Option<WorkloadRef>> {
        let params = ListParams::default().fields(&format!("status.podIP={}", address));

        let pods = self.pods_all().list(&params).await.map_err(|e| {
            NetInsightError::KubernetesError(format!("Failed to list pods for {}: {}", address, e))
        })?;

        let found = select_pod(pods.items).map(|pod| WorkloadRef::from_k8s_pod(&pod));
        debug!(%address, found = found.is_some(), "Pod lookup");
        Ok(found)
    }

    async fn find_service_by_address(&self, address: Ipv4Addr) -> Result<Option<WorkloadRef>> {
        let services = self
            .services_all()
            .list(&ListParams::default())
            .await
            .map_err(|e| {
                NetInsightError::KubernetesError(format!("Failed to list services: {}", e))
            })?;

        let found = services
            .items
            .iter()
            .find(|svc| service_has_address(svc, address))
            .map(WorkloadRef::from_k8s_service);
        debug!(%address, found = found.is_some(), "Service lookup");
        Ok(found)
    }

    async fn inventory(&self) -> Result<WorkloadInventory> {
        let params = ListParams::default();
        let pods = self.pods_all().list(&params).await.map_err(|e| {
            NetInsightError::KubernetesError(format!("Failed to list pods: {}", e))
        })?;
        let services = self.services_all().list(&params).await.map_err(|e| {
            NetInsightError::KubernetesError(format!("Failed to list services: {}", e))
        })?;

        let pods: Vec<WorkloadRef> = pods.items.iter().map(WorkloadRef::from_k8s_pod).collect();
        let services: Vec<WorkloadRef> = services
            .items
            .iter()
            .map(WorkloadRef::from_k8s_service)
            .collect();
        debug!(pods = pods.len(), services = services.len(), "Listed workloads");

        Ok(count_workloads(&pods, &services))
    }
}

/// Pick the owner among pods reporting the same IP. Host-network pods share
/// the node address and never own it.
fn select_pod(pods: Vec<Pod>) -> Option<Pod> {
    let mut candidates: Vec<Pod> = pods
        .into_iter()
        .filter(|pod| {
            !pod.spec
                .as_ref()
                .and_then(|s| s.host_network)
                .unwrap_or(false)
        })
        .collect();

    candidates.sort_by(|a, b| {
        is_running(b)
            .cmp(&is_running(a))
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
    candidates.into_iter().next()
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Running")
        .unwrap_or(false)
}

fn service_has_address(service: &Service, address: Ipv4Addr) -> bool {
    let Some(spec) = service.spec.as_ref() else {
        return false;
    };
    let wanted = address.to_string();

    spec.cluster_ip.as_deref() == Some(wanted.as_str())
        || spec
            .cluster_ips
            .as_ref()
            .map(|ips| ips.iter().any(|ip| *ip == wanted))
            .unwrap_or(false)
}
