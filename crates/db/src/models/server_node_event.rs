//! `server_node_events` rows (append-only).

use nodefleet_core::error::CoreError;
use nodefleet_core::node::{NodeEvent, NodeEventType};
use nodefleet_core::types::{DbId, Timestamp};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct ServerNodeEventRow {
    pub id: DbId,
    pub server_node_id: DbId,
    /// `INFO` or `ERROR`, enforced by a CHECK constraint.
    pub event_type: String,
    pub message: String,
    pub created_at: Timestamp,
}

impl TryFrom<ServerNodeEventRow> for NodeEvent {
    type Error = CoreError;

    fn try_from(row: ServerNodeEventRow) -> Result<Self, Self::Error> {
        let event_type = NodeEventType::parse(&row.event_type).ok_or_else(|| {
            CoreError::Internal(format!(
                "unknown event type {:?} on event {}",
                row.event_type, row.id
            ))
        })?;
        Ok(Self {
            id: row.id,
            server_node_id: row.server_node_id,
            event_type,
            message: row.message,
            created_at: row.created_at,
        })
    }
}
