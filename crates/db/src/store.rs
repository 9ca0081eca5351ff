//! [`NodeStore`] backed by PostgreSQL.

use async_trait::async_trait;
use nodefleet_core::criteria::NodeQuery;
use nodefleet_core::error::CoreError;
use nodefleet_core::node::{
    CreateNode, CreateNodeEvent, Lease, LifecycleOwner, NodeEvent, NodeRecord,
};
use nodefleet_core::registry::{NodeStore, LEASE_ENTITY, LIFECYCLE_OWNER_ENTITY, NODE_ENTITY};
use nodefleet_core::types::{DbId, Version};

use crate::repositories::{LeaseRepo, ServerNodeEventRepo, ServerNodeRepo};
use crate::DbPool;

/// PostgreSQL unique constraint violation.
const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL foreign key violation.
const FOREIGN_KEY_VIOLATION: &str = "23503";

#[derive(Clone)]
pub struct PgNodeStore {
    pool: DbPool,
}

impl PgNodeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Tell a missing row from a stale version after a conditional write
    /// touched nothing.
    async fn version_mismatch(&self, id: DbId, expected: Version) -> CoreError {
        match ServerNodeRepo::current_version(&self.pool, id).await {
            Ok(Some(actual)) => CoreError::ConcurrentModification {
                entity: NODE_ENTITY,
                id,
                expected,
                actual,
            },
            Ok(None) => CoreError::NotFound {
                entity: NODE_ENTITY,
                id,
            },
            Err(e) => map_db_error(e),
        }
    }
}

/// Map a sqlx error into the domain error.
///
/// Unique violations become [`CoreError::Conflict`]; everything else is a
/// storage failure.
pub fn map_db_error(err: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            let constraint = db_err.constraint().unwrap_or("unknown");
            return CoreError::Conflict(format!(
                "Duplicate value violates unique constraint: {constraint}"
            ));
        }
    }
    tracing::error!(error = %err, "Database error");
    CoreError::Storage(err.to_string())
}

/// Name of the violated foreign key constraint, if `err` is one.
fn foreign_key_constraint(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
            Some(db_err.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

#[async_trait]
impl NodeStore for PgNodeStore {
    // ── Nodes ────────────────────────────────────────────────────────────

    async fn insert_node(&self, input: &CreateNode) -> Result<NodeRecord, CoreError> {
        ServerNodeRepo::create(&self.pool, input)
            .await
            .map(NodeRecord::from)
            .map_err(map_db_error)
    }

    async fn find_node(&self, id: DbId) -> Result<Option<NodeRecord>, CoreError> {
        Ok(ServerNodeRepo::find_by_id(&self.pool, id)
            .await
            .map_err(map_db_error)?
            .map(NodeRecord::from))
    }

    async fn find_node_by_server_id(
        &self,
        server_id: &str,
    ) -> Result<Option<NodeRecord>, CoreError> {
        Ok(ServerNodeRepo::find_by_server_id(&self.pool, server_id)
            .await
            .map_err(map_db_error)?
            .map(NodeRecord::from))
    }

    async fn find_node_by_lifecycle_owner(
        &self,
        lifecycle_owner_id: DbId,
    ) -> Result<Option<NodeRecord>, CoreError> {
        Ok(
            ServerNodeRepo::find_by_lifecycle_owner(&self.pool, lifecycle_owner_id)
                .await
                .map_err(map_db_error)?
                .map(NodeRecord::from),
        )
    }

    async fn query_nodes(&self, query: &NodeQuery) -> Result<Vec<NodeRecord>, CoreError> {
        let rows = ServerNodeRepo::query(&self.pool, query)
            .await
            .map_err(map_db_error)?;
        Ok(rows.into_iter().map(NodeRecord::from).collect())
    }

    async fn count_nodes(&self) -> Result<i64, CoreError> {
        ServerNodeRepo::count(&self.pool).await.map_err(map_db_error)
    }

    async fn all_nodes(&self) -> Result<Vec<NodeRecord>, CoreError> {
        let rows = ServerNodeRepo::list_all(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(rows.into_iter().map(NodeRecord::from).collect())
    }

    async fn update_node(
        &self,
        node: &NodeRecord,
        expected_version: Version,
    ) -> Result<NodeRecord, CoreError> {
        match ServerNodeRepo::update_versioned(&self.pool, node, expected_version).await {
            Ok(Some(row)) => Ok(row.into()),
            Ok(None) => Err(self.version_mismatch(node.id, expected_version).await),
            Err(e) => match foreign_key_constraint(&e) {
                Some(constraint) if constraint.contains("lifecycle_owner") => {
                    Err(CoreError::NotFound {
                        entity: LIFECYCLE_OWNER_ENTITY,
                        id: node.lifecycle_owner_id.unwrap_or_default(),
                    })
                }
                Some(constraint) if constraint.contains("lease") => Err(CoreError::NotFound {
                    entity: LEASE_ENTITY,
                    id: node.lease_id.unwrap_or_default(),
                }),
                _ => Err(map_db_error(e)),
            },
        }
    }

    async fn delete_node(&self, id: DbId, expected_version: Version) -> Result<(), CoreError> {
        let deleted = ServerNodeRepo::delete_versioned(&self.pool, id, expected_version)
            .await
            .map_err(map_db_error)?;
        if deleted {
            Ok(())
        } else {
            Err(self.version_mismatch(id, expected_version).await)
        }
    }

    // ── Events ───────────────────────────────────────────────────────────

    async fn append_event(&self, event: &CreateNodeEvent) -> Result<NodeEvent, CoreError> {
        let row = ServerNodeEventRepo::create(&self.pool, event)
            .await
            .map_err(|e| {
                if foreign_key_constraint(&e).is_some() {
                    CoreError::NotFound {
                        entity: NODE_ENTITY,
                        id: event.server_node_id,
                    }
                } else {
                    map_db_error(e)
                }
            })?;
        NodeEvent::try_from(row)
    }

    async fn list_events(&self, server_node_id: DbId) -> Result<Vec<NodeEvent>, CoreError> {
        ServerNodeEventRepo::list_for_node(&self.pool, server_node_id)
            .await
            .map_err(map_db_error)?
            .into_iter()
            .map(NodeEvent::try_from)
            .collect()
    }

    // ── Associations ─────────────────────────────────────────────────────

    async fn insert_lease(&self, extra_timeout_ms: i64) -> Result<Lease, CoreError> {
        LeaseRepo::create_lease(&self.pool, extra_timeout_ms)
            .await
            .map(Lease::from)
            .map_err(map_db_error)
    }

    async fn find_lease(&self, id: DbId) -> Result<Option<Lease>, CoreError> {
        Ok(LeaseRepo::find_lease(&self.pool, id)
            .await
            .map_err(map_db_error)?
            .map(Lease::from))
    }

    async fn insert_lifecycle_owner(
        &self,
        life_expectancy_ms: i64,
    ) -> Result<LifecycleOwner, CoreError> {
        LeaseRepo::create_lifecycle_owner(&self.pool, life_expectancy_ms)
            .await
            .map(LifecycleOwner::from)
            .map_err(map_db_error)
    }

    async fn find_lifecycle_owner(&self, id: DbId) -> Result<Option<LifecycleOwner>, CoreError> {
        Ok(LeaseRepo::find_lifecycle_owner(&self.pool, id)
            .await
            .map_err(map_db_error)?
            .map(LifecycleOwner::from))
    }
}
