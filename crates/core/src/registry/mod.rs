//! CRUD and query facade over a [`NodeStore`].
//!
//! Every mutation takes the version the caller last read. A mismatch fails
//! with [`CoreError::ConcurrentModification`]; the registry never retries on
//! the caller's behalf. Successful mutations append an INFO event to the
//! node's log on a best-effort basis.

pub mod memory;
pub mod store;

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::criteria::NodeQuery;
use crate::error::CoreError;
use crate::expiration::{LeaseState, NodeLease, TimeLeft};
use crate::node::{
    CreateNode, CreateNodeEvent, Lease, LifecycleOwner, NodeEvent, NodeRecord, ServerInfo,
};
use crate::secrets::SecretStore;
use crate::types::{DbId, Timestamp, Version};

pub use memory::MemoryNodeStore;
pub use store::{NodeStore, LEASE_ENTITY, LIFECYCLE_OWNER_ENTITY, NODE_ENTITY};

/// Authoritative access point for node state.
#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn NodeStore>,
    secrets: Arc<dyn SecretStore>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn NodeStore>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { store, secrets }
    }

    // ── Creation ─────────────────────────────────────────────────────────

    /// Record a freshly provisioned server, created now.
    pub async fn create(&self, info: ServerInfo) -> Result<NodeRecord, CoreError> {
        self.create_at(info, Utc::now()).await
    }

    /// Record a provisioned server with an explicit creation time.
    pub async fn create_at(
        &self,
        info: ServerInfo,
        creation_time: Timestamp,
    ) -> Result<NodeRecord, CoreError> {
        let node = self
            .store
            .insert_node(&CreateNode::from_server(info, creation_time))
            .await?;
        self.audit(node.info_event("server node created")).await;
        Ok(node)
    }

    /// Pre-create a node that is still waiting for its provider id.
    pub async fn create_placeholder(&self) -> Result<NodeRecord, CoreError> {
        let node = self
            .store
            .insert_node(&CreateNode::placeholder(Utc::now()))
            .await?;
        self.audit(node.info_event("placeholder node created")).await;
        Ok(node)
    }

    pub async fn create_lease(&self, extra_timeout: Duration) -> Result<Lease, CoreError> {
        self.store
            .insert_lease(extra_timeout.num_milliseconds())
            .await
    }

    pub async fn create_lifecycle_owner(
        &self,
        life_expectancy: Duration,
    ) -> Result<LifecycleOwner, CoreError> {
        self.store
            .insert_lifecycle_owner(life_expectancy.num_milliseconds())
            .await
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn find(&self, id: DbId) -> Result<Option<NodeRecord>, CoreError> {
        self.store.find_node(id).await
    }

    /// Exact match on the provider id. With duplicates, any one may be returned.
    pub async fn find_by_node_id(&self, server_id: &str) -> Result<Option<NodeRecord>, CoreError> {
        self.store.find_node_by_server_id(server_id).await
    }

    /// Nodes matching `query`. No match is an empty vector, never an error.
    pub async fn query(&self, query: &NodeQuery) -> Result<Vec<NodeRecord>, CoreError> {
        self.store.query_nodes(query).await
    }

    pub async fn count(&self) -> Result<i64, CoreError> {
        self.store.count_nodes().await
    }

    pub async fn all(&self) -> Result<Vec<NodeRecord>, CoreError> {
        self.store.all_nodes().await
    }

    /// The node's event log in append order.
    pub async fn events(&self, id: DbId) -> Result<Vec<NodeEvent>, CoreError> {
        self.store.list_events(id).await
    }

    /// Persist an event built with [`NodeRecord::info_event`] or
    /// [`NodeRecord::error_event`].
    pub async fn record_event(&self, event: &CreateNodeEvent) -> Result<NodeEvent, CoreError> {
        self.store.append_event(event).await
    }

    // ── Mutations ────────────────────────────────────────────────────────

    pub async fn set_busy(
        &self,
        id: DbId,
        expected_version: Version,
        busy: bool,
    ) -> Result<NodeRecord, CoreError> {
        self.mutate(id, expected_version, format!("busy set to {busy}"), |n| {
            n.busy = busy
        })
        .await
    }

    pub async fn set_stopped(
        &self,
        id: DbId,
        expected_version: Version,
        stopped: bool,
    ) -> Result<NodeRecord, CoreError> {
        self.mutate(
            id,
            expected_version,
            format!("stopped set to {stopped}"),
            |n| n.stopped = stopped,
        )
        .await
    }

    pub async fn set_remote(
        &self,
        id: DbId,
        expected_version: Version,
        remote: bool,
    ) -> Result<NodeRecord, CoreError> {
        self.mutate(
            id,
            expected_version,
            format!("remote set to {remote}"),
            |n| n.remote = remote,
        )
        .await
    }

    /// Fill in the provider id and addresses once provisioning completes.
    pub async fn assign_server(
        &self,
        id: DbId,
        expected_version: Version,
        info: ServerInfo,
    ) -> Result<NodeRecord, CoreError> {
        let message = format!(
            "assigned server {} [public={}, private={}]",
            info.server_id,
            info.public_ip.as_deref().unwrap_or("-"),
            info.private_ip.as_deref().unwrap_or("-"),
        );
        self.mutate(id, expected_version, message, move |n| {
            n.server_id = Some(info.server_id);
            n.public_ip = info.public_ip;
            n.private_ip = info.private_ip;
        })
        .await
    }

    pub async fn set_credentials(
        &self,
        id: DbId,
        expected_version: Version,
        key: String,
        project: String,
    ) -> Result<NodeRecord, CoreError> {
        let message = format!("credentials set for project {project}");
        self.mutate(id, expected_version, message, move |n| {
            n.key = Some(key);
            n.project = Some(project);
        })
        .await
    }

    pub async fn set_private_key(
        &self,
        id: DbId,
        expected_version: Version,
        private_key: String,
    ) -> Result<NodeRecord, CoreError> {
        self.mutate(id, expected_version, "private key updated".into(), move |n| {
            n.private_key = Some(private_key)
        })
        .await
    }

    /// Hand the node to a user, or take it back with `None`.
    pub async fn set_owner(
        &self,
        id: DbId,
        expected_version: Version,
        owner_id: Option<DbId>,
    ) -> Result<NodeRecord, CoreError> {
        let message = match owner_id {
            Some(user) => format!("owner set to user {user}"),
            None => "owner cleared".to_string(),
        };
        self.mutate(id, expected_version, message, move |n| n.owner_id = owner_id)
            .await
    }

    /// Attach (or with `None`, detach) a lease.
    pub async fn attach_lease(
        &self,
        id: DbId,
        expected_version: Version,
        lease_id: Option<DbId>,
    ) -> Result<NodeRecord, CoreError> {
        let message = match lease_id {
            Some(lease_id) => {
                if self.store.find_lease(lease_id).await?.is_none() {
                    return Err(CoreError::NotFound {
                        entity: LEASE_ENTITY,
                        id: lease_id,
                    });
                }
                format!("lease {lease_id} attached")
            }
            None => "lease detached".to_string(),
        };
        self.mutate(id, expected_version, message, move |n| n.lease_id = lease_id)
            .await
    }

    /// Attach (or with `None`, detach) the lifecycle owner.
    ///
    /// An owner may reference at most one node; attaching one that is held by
    /// a different node fails with [`CoreError::Conflict`].
    pub async fn attach_lifecycle_owner(
        &self,
        id: DbId,
        expected_version: Version,
        lifecycle_owner_id: Option<DbId>,
    ) -> Result<NodeRecord, CoreError> {
        let message = match lifecycle_owner_id {
            Some(owner_id) => {
                if self.store.find_lifecycle_owner(owner_id).await?.is_none() {
                    return Err(CoreError::NotFound {
                        entity: LIFECYCLE_OWNER_ENTITY,
                        id: owner_id,
                    });
                }
                if let Some(holder) = self.store.find_node_by_lifecycle_owner(owner_id).await? {
                    if holder.id != id {
                        return Err(CoreError::Conflict(format!(
                            "lifecycle owner {owner_id} is already attached to node {}",
                            holder.id
                        )));
                    }
                }
                format!("lifecycle owner {owner_id} attached")
            }
            None => "lifecycle owner detached".to_string(),
        };
        self.mutate(id, expected_version, message, move |n| {
            n.lifecycle_owner_id = lifecycle_owner_id
        })
        .await
    }

    /// Destroy a node: detach its lifecycle owner, then delete the record and
    /// its events.
    ///
    /// Both steps run inside one version-checked store operation, so a writer
    /// that lands first leaves the node fully intact and this call fails with
    /// [`CoreError::ConcurrentModification`].
    pub async fn reclaim(&self, id: DbId, expected_version: Version) -> Result<(), CoreError> {
        let node = self.require(id).await?;
        self.store.delete_node(id, expected_version).await?;
        tracing::info!(
            node_id = id,
            server_id = ?node.server_id,
            lifecycle_owner_id = ?node.lifecycle_owner_id,
            "server node reclaimed"
        );
        Ok(())
    }

    // ── Expiration ───────────────────────────────────────────────────────

    /// Resolve the node's lease and lifecycle owner, then classify it.
    pub async fn lease_state(
        &self,
        node: &NodeRecord,
        now: Timestamp,
    ) -> Result<LeaseState, CoreError> {
        let lease = match node.lease_id {
            Some(lease_id) => self.store.find_lease(lease_id).await?,
            None => None,
        };
        let owner = match node.lifecycle_owner_id {
            Some(owner_id) => self.store.find_lifecycle_owner(owner_id).await?,
            None => None,
        };
        Ok(NodeLease::new(node, lease.as_ref(), owner.as_ref()).state(now))
    }

    pub async fn time_left(
        &self,
        node: &NodeRecord,
        now: Timestamp,
    ) -> Result<Option<TimeLeft>, CoreError> {
        Ok(self.lease_state(node, now).await?.time_left())
    }

    pub async fn is_expired(&self, node: &NodeRecord, now: Timestamp) -> Result<bool, CoreError> {
        Ok(self.lease_state(node, now).await?.is_expired())
    }

    // ── Secrets ──────────────────────────────────────────────────────────

    /// The node's secret key, if its `(project, key)` pair is set and cached.
    pub async fn secret_key(&self, node: &NodeRecord) -> Option<String> {
        let (project, key) = node.secret_key_token()?;
        self.secrets.get(&project, &key).await
    }

    pub async fn set_secret_key(&self, node: &NodeRecord, secret: String) -> Result<(), CoreError> {
        let (project, key) = node.secret_key_token().ok_or_else(|| {
            CoreError::Validation(format!(
                "node {} has no project/key pair to store a secret under",
                node.id
            ))
        })?;
        self.secrets.set(&project, &key, secret).await;
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn require(&self, id: DbId) -> Result<NodeRecord, CoreError> {
        self.store.find_node(id).await?.ok_or(CoreError::NotFound {
            entity: NODE_ENTITY,
            id,
        })
    }

    /// Read, check the caller's version, apply `change`, and write back.
    async fn mutate<F>(
        &self,
        id: DbId,
        expected_version: Version,
        description: String,
        change: F,
    ) -> Result<NodeRecord, CoreError>
    where
        F: FnOnce(&mut NodeRecord) + Send,
    {
        let mut node = self.require(id).await?;
        if node.version != expected_version {
            return Err(CoreError::ConcurrentModification {
                entity: NODE_ENTITY,
                id,
                expected: expected_version,
                actual: node.version,
            });
        }

        change(&mut node);
        let updated = self.store.update_node(&node, expected_version).await?;
        self.audit(updated.info_event(description)).await;
        Ok(updated)
    }

    async fn audit(&self, event: CreateNodeEvent) {
        if let Err(e) = self.store.append_event(&event).await {
            tracing::warn!(
                node_id = event.server_node_id,
                error = %e,
                "failed to record node event"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::criteria::NodeCriteria;
    use crate::node::test_helpers::at_ms;
    use crate::node::NodeEventType;
    use crate::secrets::MemorySecretStore;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(
            Arc::new(MemoryNodeStore::new()),
            Arc::new(MemorySecretStore::new()),
        )
    }

    fn info(id: &str) -> ServerInfo {
        ServerInfo::new(id, Some("198.51.100.7".into()), Some("10.1.0.7".into()))
    }

    #[tokio::test]
    async fn create_starts_idle_at_version_zero() {
        let reg = registry();
        let node = reg.create(info("i-1")).await.expect("create");
        assert_eq!(node.server_id.as_deref(), Some("i-1"));
        assert!(!node.busy && !node.stopped && !node.remote);
        assert_eq!(node.version, 0);
        assert_eq!(reg.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn placeholder_is_found_by_null_server_id() {
        let reg = registry();
        let placeholder = reg.create_placeholder().await.expect("placeholder");
        reg.create(info("i-2")).await.expect("create");

        let q = NodeQuery::new().criteria(NodeCriteria::new().server_id_is_null(true));
        let found = reg.query(&q).await.expect("query");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, placeholder.id);

        let assigned = reg
            .assign_server(placeholder.id, placeholder.version, info("i-3"))
            .await
            .expect("assign");
        assert_eq!(assigned.server_id.as_deref(), Some("i-3"));
        assert!(reg.query(&q).await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn stale_version_is_a_concurrent_modification() {
        let reg = registry();
        let node = reg.create(info("i-1")).await.expect("create");
        reg.set_busy(node.id, node.version, true)
            .await
            .expect("first write");

        let err = reg
            .set_stopped(node.id, node.version, true)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let fresh = reg.find(node.id).await.expect("find").expect("present");
        let stopped = reg
            .set_stopped(fresh.id, fresh.version, true)
            .await
            .expect("retry with fresh version");
        assert!(stopped.busy && stopped.stopped);
        assert_eq!(stopped.version, 2);
    }

    #[tokio::test]
    async fn mutations_are_recorded_as_events_in_order() {
        let reg = registry();
        let node = reg.create(info("i-1")).await.expect("create");
        let node = reg.set_busy(node.id, node.version, true).await.expect("busy");
        reg.set_remote(node.id, node.version, true)
            .await
            .expect("remote");

        let events = reg.events(node.id).await.expect("events");
        let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["server node created", "busy set to true", "remote set to true"]
        );
        assert!(events.iter().all(|e| e.event_type == NodeEventType::Info));
    }

    #[tokio::test]
    async fn error_events_can_be_recorded_explicitly() {
        let reg = registry();
        let node = reg.create(info("i-1")).await.expect("create");
        let event = reg
            .record_event(&node.error_event("bootstrap failed"))
            .await
            .expect("record");
        assert_eq!(event.event_type, NodeEventType::Error);
    }

    #[tokio::test]
    async fn find_by_node_id_misses_return_none() {
        let reg = registry();
        reg.create(info("i-1")).await.expect("create");
        assert!(reg.find_by_node_id("i-9").await.expect("find").is_none());
        assert!(reg.find_by_node_id("i-1").await.expect("find").is_some());
    }

    #[tokio::test]
    async fn attaching_unknown_associations_fails() {
        let reg = registry();
        let node = reg.create(info("i-1")).await.expect("create");
        assert_matches!(
            reg.attach_lease(node.id, node.version, Some(999)).await,
            Err(CoreError::NotFound { entity: LEASE_ENTITY, id: 999 })
        );
        assert_matches!(
            reg.attach_lifecycle_owner(node.id, node.version, Some(999))
                .await,
            Err(CoreError::NotFound {
                entity: LIFECYCLE_OWNER_ENTITY,
                id: 999
            })
        );
    }

    #[tokio::test]
    async fn lifecycle_owner_is_exclusive() {
        let reg = registry();
        let owner = reg
            .create_lifecycle_owner(Duration::minutes(10))
            .await
            .expect("owner");
        let a = reg.create(info("a")).await.expect("create");
        let b = reg.create(info("b")).await.expect("create");

        reg.attach_lifecycle_owner(a.id, a.version, Some(owner.id))
            .await
            .expect("attach a");
        assert_matches!(
            reg.attach_lifecycle_owner(b.id, b.version, Some(owner.id))
                .await,
            Err(CoreError::Conflict(_))
        );
    }

    #[tokio::test]
    async fn expiration_resolves_associations() {
        let reg = registry();
        let node = reg
            .create_at(info("i-1"), at_ms(1_000))
            .await
            .expect("create");
        let owner = reg
            .create_lifecycle_owner(Duration::milliseconds(5_000))
            .await
            .expect("owner");
        let node = reg
            .attach_lifecycle_owner(node.id, node.version, Some(owner.id))
            .await
            .expect("attach owner");
        assert_eq!(
            reg.time_left(&node, at_ms(2_000)).await.expect("time left"),
            Some(TimeLeft::Finite(Duration::milliseconds(4_000)))
        );

        let lease = reg
            .create_lease(Duration::milliseconds(500))
            .await
            .expect("lease");
        let node = reg
            .attach_lease(node.id, node.version, Some(lease.id))
            .await
            .expect("attach lease");
        assert_eq!(
            reg.time_left(&node, at_ms(2_000)).await.expect("time left"),
            Some(TimeLeft::Finite(Duration::milliseconds(-500)))
        );
        assert!(reg.is_expired(&node, at_ms(2_000)).await.expect("expired"));
    }

    #[tokio::test]
    async fn reclaim_releases_owner_with_the_node() {
        let reg = registry();
        let owner = reg
            .create_lifecycle_owner(Duration::seconds(1))
            .await
            .expect("owner");
        let node = reg.create(info("i-1")).await.expect("create");
        let node = reg
            .attach_lifecycle_owner(node.id, node.version, Some(owner.id))
            .await
            .expect("attach");

        reg.reclaim(node.id, node.version).await.expect("reclaim");
        assert!(reg.find(node.id).await.expect("find").is_none());
        assert!(reg.events(node.id).await.expect("events").is_empty());

        // The owner is free to be attached elsewhere.
        let other = reg.create(info("i-2")).await.expect("create");
        reg.attach_lifecycle_owner(other.id, other.version, Some(owner.id))
            .await
            .expect("owner released");
    }

    #[tokio::test]
    async fn reclaim_with_stale_version_is_rejected() {
        let reg = registry();
        let node = reg.create(info("i-1")).await.expect("create");
        reg.set_busy(node.id, node.version, true).await.expect("busy");
        assert_matches!(
            reg.reclaim(node.id, node.version).await,
            Err(CoreError::ConcurrentModification { .. })
        );
        assert!(reg.find(node.id).await.expect("find").is_some());
    }

    #[tokio::test]
    async fn failed_reclaim_leaves_owner_attached() {
        let reg = registry();
        let owner = reg
            .create_lifecycle_owner(Duration::seconds(1))
            .await
            .expect("owner");
        let node = reg.create(info("i-1")).await.expect("create");
        let stale = reg
            .attach_lifecycle_owner(node.id, node.version, Some(owner.id))
            .await
            .expect("attach");
        let lease = reg
            .create_lease(Duration::minutes(10))
            .await
            .expect("lease");
        reg.attach_lease(stale.id, stale.version, Some(lease.id))
            .await
            .expect("renew");

        assert_matches!(
            reg.reclaim(stale.id, stale.version).await,
            Err(CoreError::ConcurrentModification { .. })
        );
        let current = reg.find(node.id).await.expect("find").expect("node");
        assert_eq!(current.lifecycle_owner_id, Some(owner.id));
        assert_eq!(current.lease_id, Some(lease.id));
    }

    #[tokio::test]
    async fn secret_keys_are_scoped_by_project_and_key() {
        let reg = registry();
        let node = reg.create(info("i-1")).await.expect("create");
        assert_matches!(
            reg.set_secret_key(&node, "s3cr3t".into()).await,
            Err(CoreError::Validation(_))
        );

        let node = reg
            .set_credentials(node.id, node.version, "api-1".into(), "proj".into())
            .await
            .expect("credentials");
        reg.set_secret_key(&node, "s3cr3t".into())
            .await
            .expect("store secret");
        assert_eq!(reg.secret_key(&node).await.as_deref(), Some("s3cr3t"));
    }
}
