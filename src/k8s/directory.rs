//! Address lookups against the cluster's workload directory

use super::types::{count_workloads, WorkloadInventory, WorkloadRef};
use crate::{NetInsightError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Answers which workload owns an address.
///
/// `Ok(None)` means the directory has no match. `Err` means the directory
/// could not be asked.
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    async fn find_pod_by_address(&self, address: Ipv4Addr) -> Result<Option<WorkloadRef>>;

    async fn find_service_by_address(&self, address: Ipv4Addr) -> Result<Option<WorkloadRef>>;

    /// Pod and service counts per namespace
    async fn inventory(&self) -> Result<WorkloadInventory>;
}

/// Fixed address table. Serves clusterless runs and tests.
#[derive(Default)]
pub struct StaticDirectory {
    pods: HashMap<Ipv4Addr, WorkloadRef>,
    services: HashMap<Ipv4Addr, WorkloadRef>,
    latency: Option<Duration>,
    failing: bool,
    pod_queries: AtomicU64,
    service_queries: AtomicU64,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pod(mut self, address: Ipv4Addr, namespace: &str, name: &str) -> Self {
        self.pods.insert(address, WorkloadRef::new(namespace, name));
        self
    }

    pub fn with_service(mut self, address: Ipv4Addr, namespace: &str, name: &str) -> Self {
        self.services
            .insert(address, WorkloadRef::new(namespace, name));
        self
    }

    /// Delay every query by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Every query returns an error
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn pod_queries(&self) -> u64 {
        self.pod_queries.load(Ordering::SeqCst)
    }

    pub fn service_queries(&self) -> u64 {
        self.service_queries.load(Ordering::SeqCst)
    }

    pub fn total_queries(&self) -> u64 {
        self.pod_queries() + self.service_queries()
    }

    async fn answer(
        &self,
        table: &HashMap<Ipv4Addr, WorkloadRef>,
        address: Ipv4Addr,
    ) -> Result<Option<WorkloadRef>> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing {
            return Err(NetInsightError::KubernetesError(format!(
                "static directory unavailable for {}",
                address
            )));
        }
        Ok(table.get(&address).cloned())
    }
}

#[async_trait]
impl ClusterDirectory for StaticDirectory {
    async fn find_pod_by_address(&self, address: Ipv4Addr) -> Result<Option<WorkloadRef>> {
        self.pod_queries.fetch_add(1, Ordering::SeqCst);
        self.answer(&self.pods, address).await
    }

    async fn find_service_by_address(&self, address: Ipv4Addr) -> Result<Option<WorkloadRef>> {
        self.service_queries.fetch_add(1, Ordering::SeqCst);
        self.answer(&self.services, address).await
    }

    async fn inventory(&self) -> Result<WorkloadInventory> {
        if self.failing {
            return Err(NetInsightError::KubernetesError(
                "static directory unavailable for inventory".to_string(),
            ));
        }
        Ok(count_workloads(self.pods.values(), self.services.values()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_lookups_are_counted() {
        let addr = Ipv4Addr::new(10, 1, 0, 4);
        let dir = StaticDirectory::new().with_service(addr, "default", "api");

        assert_eq!(dir.find_pod_by_address(addr).await.unwrap(), None);
        assert_eq!(
            dir.find_service_by_address(addr).await.unwrap(),
            Some(WorkloadRef::new("default", "api"))
        );
        assert_eq!(dir.pod_queries(), 1);
        assert_eq!(dir.service_queries(), 1);
    }

    #[tokio::test]
    async fn test_inventory_does_not_count_as_lookup() {
        let dir = StaticDirectory::new()
            .with_pod(Ipv4Addr::new(10, 1, 0, 4), "shop", "web-0")
            .with_pod(Ipv4Addr::new(10, 1, 0, 5), "shop", "web-1")
            .with_service(Ipv4Addr::new(10, 96, 0, 1), "default", "kubernetes");

        let inventory = dir.inventory().await.unwrap();
        assert_eq!(inventory["shop"].pods, 2);
        assert_eq!(inventory["default"].services, 1);
        assert_eq!(dir.total_queries(), 0);
        assert!(StaticDirectory::new().failing().inventory().await.is_err());
    }

    #[tokio::test]
    async fn test_failing_directory_errors() {
        let dir = StaticDirectory::new().failing();
        assert!(dir
            .find_pod_by_address(Ipv4Addr::LOCALHOST)
            .await
            .is_err());
    }
}
