//! Address to workload resolution with a TTL cache
//!
//! Positive and negative answers are both cached, for `positive_ttl` and
//! `negative_ttl` respectively. Expired entries are dropped when next looked
//! up. Concurrent misses for one address share a single directory lookup.

use super::directory::ClusterDirectory;
use super::types::{WorkloadIdentity, WorkloadInventory};
use crate::config::ResolverConfig;
use crate::NetInsightError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type PendingLookup = Shared<BoxFuture<'static, WorkloadIdentity>>;

#[derive(Debug, Clone)]
struct CacheEntry {
    identity: WorkloadIdentity,
    inserted_at: Instant,
    expires_at: Instant,
}

/// Resolver counters since creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub directory_queries: u64,
    pub coalesced_waits: u64,
    pub cached_entries: usize,
}

/// Shared, cloneable resolver. Clones use the same cache.
#[derive(Clone)]
pub struct IdentityResolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    directory: Arc<dyn ClusterDirectory>,
    config: ResolverConfig,
    cache: DashMap<Ipv4Addr, CacheEntry>,
    in_flight: DashMap<Ipv4Addr, PendingLookup>,
    cancel: CancellationToken,
    hits: AtomicU64,
    misses: AtomicU64,
    queries: AtomicU64,
    coalesced: AtomicU64,
}

impl IdentityResolver {
    pub fn new(
        directory: Arc<dyn ClusterDirectory>,
        config: ResolverConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                directory,
                config,
                cache: DashMap::new(),
                in_flight: DashMap::new(),
                cancel,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                queries: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
            }),
        }
    }

    /// Resolve one address. Never fails: anything the directory cannot
    /// answer comes back as [`WorkloadIdentity::Unresolved`].
    pub async fn resolve(&self, address: Ipv4Addr) -> WorkloadIdentity {
        if let Some(identity) = self.cached(address) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return identity;
        }

        let pending = match self.inner.in_flight.entry(address) {
            Entry::Occupied(entry) => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                // A lookup may have completed since the first cache check
                if let Some(identity) = self.cached(address) {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return identity;
                }
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                let lookup = self.clone().lookup(address).boxed().shared();
                entry.insert(lookup.clone());
                lookup
            }
        };

        pending.await
    }

    /// Resolve distinct addresses with at most `concurrency` lookups running
    pub async fn resolve_many<I>(&self, addresses: I) -> HashMap<Ipv4Addr, WorkloadIdentity>
    where
        I: IntoIterator<Item = Ipv4Addr>,
    {
        let concurrency = self.inner.config.concurrency.max(1);

        stream::iter(addresses)
            .map(|address| async move { (address, self.resolve(address).await) })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            cache_hits: self.inner.hits.load(Ordering::Relaxed),
            cache_misses: self.inner.misses.load(Ordering::Relaxed),
            directory_queries: self.inner.queries.load(Ordering::Relaxed),
            coalesced_waits: self.inner.coalesced.load(Ordering::Relaxed),
            cached_entries: self.inner.cache.len(),
        }
    }

    /// Pod and service counts per namespace, or `None` when the directory
    /// cannot be listed in time. Not cached.
    pub async fn inventory(&self) -> Option<WorkloadInventory> {
        let timeout = self.inner.config.query_timeout;

        let outcome = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => return None,
            outcome = time::timeout(timeout, self.inner.directory.inventory()) => outcome,
        };

        match outcome {
            Ok(Ok(inventory)) => Some(inventory),
            Ok(Err(e)) => {
                warn!(error = %e, "Workload inventory unavailable");
                None
            }
            Err(_) => {
                warn!(timeout = ?timeout, "Workload inventory timed out");
                None
            }
        }
    }

    /// Entries currently held, including expired ones not yet evicted
    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }

    fn cached(&self, address: Ipv4Addr) -> Option<WorkloadIdentity> {
        let now = Instant::now();

        let inserted_at = match self.inner.cache.get(&address) {
            Some(entry) if entry.expires_at > now => return Some(entry.identity.clone()),
            Some(entry) => entry.inserted_at,
            None => return None,
        };

        if self
            .inner
            .cache
            .remove_if(&address, |_, entry| entry.expires_at <= now)
            .is_some()
        {
            debug!(%address, age = ?now.duration_since(inserted_at), "Evicted expired cache entry");
        }
        None
    }

    async fn lookup(self, address: Ipv4Addr) -> WorkloadIdentity {
        let outcome = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => None,
            identity = self.query_directory(address) => Some(identity),
        };

        let identity = match outcome {
            Some(identity) => {
                self.store(address, identity.clone());
                identity
            }
            None => {
                debug!(%address, "Lookup cancelled, result not cached");
                WorkloadIdentity::unresolved(address)
            }
        };

        // Cache first so a caller never finds neither entry
        self.inner.in_flight.remove(&address);
        identity
    }

    async fn query_directory(&self, address: Ipv4Addr) -> WorkloadIdentity {
        let timeout = self.inner.config.query_timeout;
        let directory = &self.inner.directory;

        self.inner.queries.fetch_add(1, Ordering::Relaxed);
        match time::timeout(timeout, directory.find_pod_by_address(address)).await {
            Ok(Ok(Some(pod))) => return WorkloadIdentity::pod(pod),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                warn!(%address, error = %e, "Pod lookup failed, trying services");
            }
            Err(_) => {
                self.log_timeout(address);
                return WorkloadIdentity::unresolved(address);
            }
        }

        self.inner.queries.fetch_add(1, Ordering::Relaxed);
        match time::timeout(timeout, directory.find_service_by_address(address)).await {
            Ok(Ok(Some(service))) => WorkloadIdentity::service(service),
            Ok(Ok(None)) => {
                debug!(%address, "No workload owns address");
                WorkloadIdentity::unresolved(address)
            }
            Ok(Err(e)) => {
                warn!(%address, error = %e, "Service lookup failed");
                WorkloadIdentity::unresolved(address)
            }
            Err(_) => {
                self.log_timeout(address);
                WorkloadIdentity::unresolved(address)
            }
        }
    }

    fn log_timeout(&self, address: Ipv4Addr) {
        let err = NetInsightError::ResolutionTimeout {
            address: address.to_string(),
            timeout_ms: self.inner.config.query_timeout.as_millis() as u64,
        };
        warn!(error = %err, "Resolving as unresolved");
    }

    fn store(&self, address: Ipv4Addr, identity: WorkloadIdentity) {
        let ttl = if identity.is_resolved() {
            self.inner.config.positive_ttl
        } else {
            self.inner.config.negative_ttl
        };
        let now = Instant::now();

        self.inner.cache.insert(
            address,
            CacheEntry {
                identity,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
    }
}
