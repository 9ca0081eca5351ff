//! In-process [`NodeStore`] backed by ordered maps.
//!
//! Used by tests and by tooling that has no database. Iteration is in id
//! order, so "first match" lookups return the lowest id.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::store::{NodeStore, LEASE_ENTITY, LIFECYCLE_OWNER_ENTITY, NODE_ENTITY};
use crate::criteria::NodeQuery;
use crate::error::CoreError;
use crate::node::{CreateNode, CreateNodeEvent, Lease, LifecycleOwner, NodeEvent, NodeRecord};
use crate::types::{DbId, Version};

#[derive(Debug, Default)]
struct State {
    last_id: DbId,
    nodes: BTreeMap<DbId, NodeRecord>,
    events: Vec<NodeEvent>,
    leases: BTreeMap<DbId, Lease>,
    owners: BTreeMap<DbId, LifecycleOwner>,
}

impl State {
    fn next_id(&mut self) -> DbId {
        self.last_id += 1;
        self.last_id
    }

    fn check_version(&self, id: DbId, expected: Version) -> Result<(), CoreError> {
        let stored = self.nodes.get(&id).ok_or(CoreError::NotFound {
            entity: NODE_ENTITY,
            id,
        })?;
        if stored.version != expected {
            return Err(CoreError::ConcurrentModification {
                entity: NODE_ENTITY,
                id,
                expected,
                actual: stored.version,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    state: RwLock<State>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn insert_node(&self, input: &CreateNode) -> Result<NodeRecord, CoreError> {
        let mut state = self.state.write().await;
        let id = state.next_id();
        let node = NodeRecord {
            id,
            server_id: input.server_id.clone(),
            key: None,
            project: None,
            public_ip: input.public_ip.clone(),
            private_ip: input.private_ip.clone(),
            busy: false,
            stopped: false,
            remote: false,
            private_key: None,
            owner_id: None,
            lease_id: None,
            lifecycle_owner_id: None,
            creation_time: input.creation_time,
            version: 0,
        };
        state.nodes.insert(id, node.clone());
        Ok(node)
    }

    async fn find_node(&self, id: DbId) -> Result<Option<NodeRecord>, CoreError> {
        Ok(self.state.read().await.nodes.get(&id).cloned())
    }

    async fn find_node_by_server_id(
        &self,
        server_id: &str,
    ) -> Result<Option<NodeRecord>, CoreError> {
        let state = self.state.read().await;
        Ok(state
            .nodes
            .values()
            .find(|n| n.server_id.as_deref() == Some(server_id))
            .cloned())
    }

    async fn find_node_by_lifecycle_owner(
        &self,
        lifecycle_owner_id: DbId,
    ) -> Result<Option<NodeRecord>, CoreError> {
        let state = self.state.read().await;
        Ok(state
            .nodes
            .values()
            .find(|n| n.lifecycle_owner_id == Some(lifecycle_owner_id))
            .cloned())
    }

    async fn query_nodes(&self, query: &NodeQuery) -> Result<Vec<NodeRecord>, CoreError> {
        let state = self.state.read().await;
        Ok(query.apply(state.nodes.values()))
    }

    async fn count_nodes(&self) -> Result<i64, CoreError> {
        Ok(self.state.read().await.nodes.len() as i64)
    }

    async fn all_nodes(&self) -> Result<Vec<NodeRecord>, CoreError> {
        Ok(self.state.read().await.nodes.values().cloned().collect())
    }

    async fn update_node(
        &self,
        node: &NodeRecord,
        expected_version: Version,
    ) -> Result<NodeRecord, CoreError> {
        let mut state = self.state.write().await;
        state.check_version(node.id, expected_version)?;

        if let Some(lease_id) = node.lease_id {
            if !state.leases.contains_key(&lease_id) {
                return Err(CoreError::NotFound {
                    entity: LEASE_ENTITY,
                    id: lease_id,
                });
            }
        }
        if let Some(owner_id) = node.lifecycle_owner_id {
            if !state.owners.contains_key(&owner_id) {
                return Err(CoreError::NotFound {
                    entity: LIFECYCLE_OWNER_ENTITY,
                    id: owner_id,
                });
            }
            let taken = state
                .nodes
                .values()
                .any(|n| n.id != node.id && n.lifecycle_owner_id == Some(owner_id));
            if taken {
                return Err(CoreError::Conflict(format!(
                    "lifecycle owner {owner_id} is already attached to another node"
                )));
            }
        }

        let mut stored = node.clone();
        stored.version = expected_version + 1;
        state.nodes.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn delete_node(&self, id: DbId, expected_version: Version) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        state.check_version(id, expected_version)?;
        if let Some(node) = state.nodes.get_mut(&id) {
            node.lifecycle_owner_id = None;
        }
        state.nodes.remove(&id);
        state.events.retain(|e| e.server_node_id != id);
        Ok(())
    }

    async fn append_event(&self, event: &CreateNodeEvent) -> Result<NodeEvent, CoreError> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(&event.server_node_id) {
            return Err(CoreError::NotFound {
                entity: NODE_ENTITY,
                id: event.server_node_id,
            });
        }
        let stored = NodeEvent {
            id: state.next_id(),
            server_node_id: event.server_node_id,
            event_type: event.event_type,
            message: event.message.clone(),
            created_at: Utc::now(),
        };
        state.events.push(stored.clone());
        Ok(stored)
    }

    async fn list_events(&self, server_node_id: DbId) -> Result<Vec<NodeEvent>, CoreError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.server_node_id == server_node_id)
            .cloned()
            .collect())
    }

    async fn insert_lease(&self, extra_timeout_ms: i64) -> Result<Lease, CoreError> {
        let mut state = self.state.write().await;
        let lease = Lease {
            id: state.next_id(),
            extra_timeout_ms,
        };
        state.leases.insert(lease.id, lease.clone());
        Ok(lease)
    }

    async fn find_lease(&self, id: DbId) -> Result<Option<Lease>, CoreError> {
        Ok(self.state.read().await.leases.get(&id).cloned())
    }

    async fn insert_lifecycle_owner(
        &self,
        life_expectancy_ms: i64,
    ) -> Result<LifecycleOwner, CoreError> {
        let mut state = self.state.write().await;
        let owner = LifecycleOwner {
            id: state.next_id(),
            life_expectancy_ms,
        };
        state.owners.insert(owner.id, owner.clone());
        Ok(owner)
    }

    async fn find_lifecycle_owner(&self, id: DbId) -> Result<Option<LifecycleOwner>, CoreError> {
        Ok(self.state.read().await.owners.get(&id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
