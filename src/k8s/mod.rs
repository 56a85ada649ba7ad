pub mod client;
pub mod directory;
pub mod resolver;
pub mod types;

pub use client::K8sClient;
pub use directory::{ClusterDirectory, StaticDirectory};
pub use resolver::{IdentityResolver, ResolverStats};
pub use types::{NamespaceInventory, WorkloadIdentity, WorkloadInventory, WorkloadRef};
