//! Storage seam for node records.
//!
//! Implementations must make [`NodeStore::update_node`] and
//! [`NodeStore::delete_node`] conditional on the stored version so that two
//! writers holding the same version cannot both succeed.

use async_trait::async_trait;

use crate::criteria::NodeQuery;
use crate::error::CoreError;
use crate::node::{CreateNode, CreateNodeEvent, Lease, LifecycleOwner, NodeEvent, NodeRecord};
use crate::types::{DbId, Version};

/// Entity name used in errors raised for node records.
pub const NODE_ENTITY: &str = "server_node";

/// Entity name used in errors raised for leases.
pub const LEASE_ENTITY: &str = "lease";

/// Entity name used in errors raised for lifecycle owners.
pub const LIFECYCLE_OWNER_ENTITY: &str = "lifecycle_owner";

#[async_trait]
pub trait NodeStore: Send + Sync {
    // ── Nodes ────────────────────────────────────────────────────────────

    async fn insert_node(&self, input: &CreateNode) -> Result<NodeRecord, CoreError>;

    async fn find_node(&self, id: DbId) -> Result<Option<NodeRecord>, CoreError>;

    /// First node with the given provider id, if any.
    async fn find_node_by_server_id(&self, server_id: &str)
        -> Result<Option<NodeRecord>, CoreError>;

    async fn find_node_by_lifecycle_owner(
        &self,
        lifecycle_owner_id: DbId,
    ) -> Result<Option<NodeRecord>, CoreError>;

    async fn query_nodes(&self, query: &NodeQuery) -> Result<Vec<NodeRecord>, CoreError>;

    async fn count_nodes(&self) -> Result<i64, CoreError>;

    async fn all_nodes(&self) -> Result<Vec<NodeRecord>, CoreError>;

    /// Persist every mutable field of `node` if the stored version equals
    /// `expected_version`. Returns the stored record with its bumped version.
    async fn update_node(
        &self,
        node: &NodeRecord,
        expected_version: Version,
    ) -> Result<NodeRecord, CoreError>;

    /// Detach the node's lifecycle owner, then delete the node and its
    /// events, as one operation that happens only if the stored version
    /// matches. A mismatch leaves the node untouched.
    async fn delete_node(&self, id: DbId, expected_version: Version) -> Result<(), CoreError>;

    // ── Events ───────────────────────────────────────────────────────────

    async fn append_event(&self, event: &CreateNodeEvent) -> Result<NodeEvent, CoreError>;

    /// Events for a node in append order.
    async fn list_events(&self, server_node_id: DbId) -> Result<Vec<NodeEvent>, CoreError>;

    // ── Associations ─────────────────────────────────────────────────────

    async fn insert_lease(&self, extra_timeout_ms: i64) -> Result<Lease, CoreError>;

    async fn find_lease(&self, id: DbId) -> Result<Option<Lease>, CoreError>;

    async fn insert_lifecycle_owner(
        &self,
        life_expectancy_ms: i64,
    ) -> Result<LifecycleOwner, CoreError>;

    async fn find_lifecycle_owner(&self, id: DbId) -> Result<Option<LifecycleOwner>, CoreError>;
}
