//! Expiration sweep over the in-memory store, including a writer racing the
//! sweep between its read and its reclaim.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use nodefleet_core::criteria::NodeQuery;
use nodefleet_core::error::CoreError;
use nodefleet_core::expiration::LeaseState;
use nodefleet_core::node::{
    CreateNode, CreateNodeEvent, Lease, LifecycleOwner, NodeEvent, NodeRecord, ServerInfo,
};
use nodefleet_core::registry::{MemoryNodeStore, NodeRegistry, NodeStore};
use nodefleet_core::secrets::MemorySecretStore;
use nodefleet_core::types::{DbId, Version};
use nodefleet_worker::sweep::{ExpirationSweep, SweepReport};

fn at_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).expect("valid timestamp")
}

/// Wraps a store and lets another writer update a node right before each of
/// the first `races` versioned deletes lands. The racing write attaches
/// `renewal_lease` when it is non-zero, otherwise it only bumps the version.
struct RacingStore {
    inner: MemoryNodeStore,
    races: AtomicUsize,
    renewal_lease: AtomicI64,
}

impl RacingStore {
    fn new() -> Self {
        Self {
            inner: MemoryNodeStore::new(),
            races: AtomicUsize::new(0),
            renewal_lease: AtomicI64::new(0),
        }
    }

    fn take_race(&self) -> bool {
        self.races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl NodeStore for RacingStore {
    async fn insert_node(&self, input: &CreateNode) -> Result<NodeRecord, CoreError> {
        self.inner.insert_node(input).await
    }

    async fn find_node(&self, id: DbId) -> Result<Option<NodeRecord>, CoreError> {
        self.inner.find_node(id).await
    }

    async fn find_node_by_server_id(
        &self,
        server_id: &str,
    ) -> Result<Option<NodeRecord>, CoreError> {
        self.inner.find_node_by_server_id(server_id).await
    }

    async fn find_node_by_lifecycle_owner(
        &self,
        lifecycle_owner_id: DbId,
    ) -> Result<Option<NodeRecord>, CoreError> {
        self.inner
            .find_node_by_lifecycle_owner(lifecycle_owner_id)
            .await
    }

    async fn query_nodes(&self, query: &NodeQuery) -> Result<Vec<NodeRecord>, CoreError> {
        self.inner.query_nodes(query).await
    }

    async fn count_nodes(&self) -> Result<i64, CoreError> {
        self.inner.count_nodes().await
    }

    async fn all_nodes(&self) -> Result<Vec<NodeRecord>, CoreError> {
        self.inner.all_nodes().await
    }

    async fn update_node(
        &self,
        node: &NodeRecord,
        expected_version: Version,
    ) -> Result<NodeRecord, CoreError> {
        self.inner.update_node(node, expected_version).await
    }

    async fn delete_node(&self, id: DbId, expected_version: Version) -> Result<(), CoreError> {
        if self.take_race() {
            if let Some(mut current) = self.inner.find_node(id).await? {
                let lease = self.renewal_lease.load(Ordering::SeqCst);
                if lease != 0 {
                    current.lease_id = Some(lease);
                }
                self.inner.update_node(&current, current.version).await?;
            }
        }
        self.inner.delete_node(id, expected_version).await
    }

    async fn append_event(&self, event: &CreateNodeEvent) -> Result<NodeEvent, CoreError> {
        self.inner.append_event(event).await
    }

    async fn list_events(&self, server_node_id: DbId) -> Result<Vec<NodeEvent>, CoreError> {
        self.inner.list_events(server_node_id).await
    }

    async fn insert_lease(&self, extra_timeout_ms: i64) -> Result<Lease, CoreError> {
        self.inner.insert_lease(extra_timeout_ms).await
    }

    async fn find_lease(&self, id: DbId) -> Result<Option<Lease>, CoreError> {
        self.inner.find_lease(id).await
    }

    async fn insert_lifecycle_owner(
        &self,
        life_expectancy_ms: i64,
    ) -> Result<LifecycleOwner, CoreError> {
        self.inner.insert_lifecycle_owner(life_expectancy_ms).await
    }

    async fn find_lifecycle_owner(&self, id: DbId) -> Result<Option<LifecycleOwner>, CoreError> {
        self.inner.find_lifecycle_owner(id).await
    }
}

fn registry_over(store: Arc<dyn NodeStore>) -> NodeRegistry {
    NodeRegistry::new(store, Arc::new(MemorySecretStore::new()))
}

/// A node created at t=0 owned by a lifecycle owner living `life_ms`.
async fn owned_node(registry: &NodeRegistry, server_id: &str, life_ms: i64) -> NodeRecord {
    let node = registry
        .create_at(ServerInfo::new(server_id, None, None), at_ms(0))
        .await
        .expect("create");
    let owner = registry
        .create_lifecycle_owner(Duration::milliseconds(life_ms))
        .await
        .expect("owner");
    registry
        .attach_lifecycle_owner(node.id, node.version, Some(owner.id))
        .await
        .expect("attach")
}

#[tokio::test]
async fn reclaims_only_expired_non_remote_nodes() {
    let registry = registry_over(Arc::new(MemoryNodeStore::new()));
    let expired = owned_node(&registry, "expired", 1_000).await;
    let alive = owned_node(&registry, "alive", 60_000).await;
    let remote = owned_node(&registry, "remote", 1_000).await;
    registry
        .set_remote(remote.id, remote.version, true)
        .await
        .expect("remote");
    let idle = registry
        .create_at(ServerInfo::new("idle", None, None), at_ms(0))
        .await
        .expect("idle");

    let sweep = ExpirationSweep::new(registry.clone(), 3);
    let report = sweep.sweep_once(at_ms(5_000)).await.expect("sweep");

    assert_eq!(
        report,
        SweepReport {
            scanned: 3,
            reclaimed: 1,
            conflicts: 0,
            errors: 0,
        }
    );
    assert!(registry.find(expired.id).await.expect("find").is_none());
    assert!(registry.find(alive.id).await.expect("find").is_some());
    assert!(registry.find(remote.id).await.expect("find").is_some());
    assert!(registry.find(idle.id).await.expect("find").is_some());
}

#[tokio::test]
async fn busy_node_without_owner_is_reclaimed() {
    let registry = registry_over(Arc::new(MemoryNodeStore::new()));
    let node = registry
        .create(ServerInfo::new("orphan", None, None))
        .await
        .expect("create");
    registry
        .set_busy(node.id, node.version, true)
        .await
        .expect("busy");

    let report = ExpirationSweep::new(registry.clone(), 3)
        .sweep_once(Utc::now())
        .await
        .expect("sweep");
    assert_eq!(report.reclaimed, 1);
    assert!(registry.find(node.id).await.expect("find").is_none());
}

#[tokio::test]
async fn version_race_is_retried_with_fresh_state() {
    let store = Arc::new(RacingStore::new());
    let registry = registry_over(store.clone());
    let node = owned_node(&registry, "raced", 1_000).await;
    store.races.store(1, Ordering::SeqCst);

    let sweep = ExpirationSweep::new(registry.clone(), 3);
    assert!(sweep
        .reclaim_if_expired(node.id, at_ms(5_000))
        .await
        .expect("reclaim"));
    assert!(registry.find(node.id).await.expect("find").is_none());
}

#[tokio::test]
async fn persistent_conflicts_are_counted_not_fatal() {
    let store = Arc::new(RacingStore::new());
    let registry = registry_over(store.clone());
    owned_node(&registry, "contended", 1_000).await;
    store.races.store(usize::MAX, Ordering::SeqCst);

    let report = ExpirationSweep::new(registry, 2)
        .sweep_once(at_ms(5_000))
        .await
        .expect("sweep");
    assert_eq!(report.scanned, 1);
    assert_eq!(report.reclaimed, 0);
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.errors, 0);
}

#[tokio::test]
async fn node_renewed_before_reclaim_survives() {
    let registry = registry_over(Arc::new(MemoryNodeStore::new()));
    let node = owned_node(&registry, "renewed", 1_000).await;
    let node = registry
        .set_remote(node.id, node.version, true)
        .await
        .expect("renew");

    let sweep = ExpirationSweep::new(registry.clone(), 3);
    assert!(!sweep
        .reclaim_if_expired(node.id, at_ms(5_000))
        .await
        .expect("check"));
    assert!(registry.find(node.id).await.expect("find").is_some());
}

#[tokio::test]
async fn lease_renewed_during_reclaim_keeps_node_intact() {
    let store = Arc::new(RacingStore::new());
    let registry = registry_over(store.clone());
    let node = owned_node(&registry, "renewed-mid-reclaim", 1_000).await;
    let owner_id = node.lifecycle_owner_id;
    let lease = registry
        .create_lease(Duration::milliseconds(60_000))
        .await
        .expect("lease");
    store.renewal_lease.store(lease.id, Ordering::SeqCst);
    store.races.store(1, Ordering::SeqCst);

    let sweep = ExpirationSweep::new(registry.clone(), 3);
    assert!(!sweep
        .reclaim_if_expired(node.id, at_ms(5_000))
        .await
        .expect("reclaim"));

    let after = registry
        .find(node.id)
        .await
        .expect("find")
        .expect("node survives");
    assert_eq!(after.lifecycle_owner_id, owner_id);
    assert_eq!(after.lease_id, Some(lease.id));
    assert_matches!(
        registry.lease_state(&after, at_ms(5_000)).await.expect("state"),
        LeaseState::Leased { .. }
    );
}
