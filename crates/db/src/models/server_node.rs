//! `server_nodes` rows.

use nodefleet_core::node::NodeRecord;
use nodefleet_core::types::{DbId, Timestamp, Version};
use sqlx::FromRow;

/// A row from the `server_nodes` table.
#[derive(Debug, Clone, FromRow)]
pub struct ServerNodeRow {
    pub id: DbId,
    pub server_id: Option<String>,
    /// Secret lookup key; `key` on the domain record.
    pub api_key: Option<String>,
    pub project: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub busy: bool,
    pub stopped: bool,
    pub remote: bool,
    pub private_key: Option<String>,
    pub owner_id: Option<DbId>,
    pub lease_id: Option<DbId>,
    pub lifecycle_owner_id: Option<DbId>,
    pub creation_time: Timestamp,
    pub version: Version,
}

impl From<ServerNodeRow> for NodeRecord {
    fn from(row: ServerNodeRow) -> Self {
        Self {
            id: row.id,
            server_id: row.server_id,
            key: row.api_key,
            project: row.project,
            public_ip: row.public_ip,
            private_ip: row.private_ip,
            busy: row.busy,
            stopped: row.stopped,
            remote: row.remote,
            private_key: row.private_key,
            owner_id: row.owner_id,
            lease_id: row.lease_id,
            lifecycle_owner_id: row.lifecycle_owner_id,
            creation_time: row.creation_time,
            version: row.version,
        }
    }
}
