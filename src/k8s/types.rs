use k8s_openapi::api::core::v1::{Pod, Service};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Directory match for an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_k8s_pod(pod: &Pod) -> Self {
        Self::from_metadata(&pod.metadata)
    }

    pub fn from_k8s_service(service: &Service) -> Self {
        Self::from_metadata(&service.metadata)
    }

    fn from_metadata(metadata: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Self {
        Self {
            namespace: metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            name: metadata.name.clone().unwrap_or_default(),
        }
    }
}

/// Cluster identity an address resolved to.
///
/// Ordering is Pods, then Services, then unresolved addresses; within a kind
/// by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadIdentity {
    Pod {
        namespace: Arc<str>,
        name: Arc<str>,
    },
    Service {
        namespace: Arc<str>,
        name: Arc<str>,
    },
    Unresolved {
        address: Ipv4Addr,
    },
}

impl WorkloadIdentity {
    pub fn pod(workload: WorkloadRef) -> Self {
        WorkloadIdentity::Pod {
            namespace: workload.namespace.into(),
            name: workload.name.into(),
        }
    }

    pub fn service(workload: WorkloadRef) -> Self {
        WorkloadIdentity::Service {
            namespace: workload.namespace.into(),
            name: workload.name.into(),
        }
    }

    pub fn unresolved(address: Ipv4Addr) -> Self {
        WorkloadIdentity::Unresolved { address }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, WorkloadIdentity::Unresolved { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkloadIdentity::Pod { .. } => "Pod",
            WorkloadIdentity::Service { .. } => "Service",
            WorkloadIdentity::Unresolved { .. } => "Unresolved",
        }
    }

    /// `namespace/name`, or the bare address when unresolved
    pub fn label(&self) -> String {
        match self {
            WorkloadIdentity::Pod { namespace, name }
            | WorkloadIdentity::Service { namespace, name } => format!("{}/{}", namespace, name),
            WorkloadIdentity::Unresolved { address } => address.to_string(),
        }
    }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadIdentity::Unresolved { address } => write!(f, "{}", address),
            _ => write!(f, "{} ({})", self.label(), self.kind()),
        }
    }
}

/// Workload counts of one namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NamespaceInventory {
    pub pods: usize,
    pub services: usize,
}

/// Workload counts by namespace
pub type WorkloadInventory = BTreeMap<String, NamespaceInventory>;

/// Count pods and services per namespace
pub fn count_workloads<'a>(
    pods: impl IntoIterator<Item = &'a WorkloadRef>,
    services: impl IntoIterator<Item = &'a WorkloadRef>,
) -> WorkloadInventory {
    let mut inventory = WorkloadInventory::new();
    for pod in pods {
        inventory.entry(pod.namespace.clone()).or_default().pods += 1;
    }
    for service in services {
        inventory
            .entry(service.namespace.clone())
            .or_default()
            .services += 1;
    }
    inventory
}
