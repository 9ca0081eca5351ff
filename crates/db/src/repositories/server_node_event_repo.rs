//! Repository for the append-only `server_node_events` table.

use nodefleet_core::node::CreateNodeEvent;
use nodefleet_core::types::DbId;
use sqlx::PgPool;

use crate::models::server_node_event::ServerNodeEventRow;

const COLUMNS: &str = "id, server_node_id, event_type, message, created_at";

pub struct ServerNodeEventRepo;

impl ServerNodeEventRepo {
    pub async fn create(
        pool: &PgPool,
        input: &CreateNodeEvent,
    ) -> Result<ServerNodeEventRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO server_node_events (server_node_id, event_type, message)
             VALUES ($1, $2, $3)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ServerNodeEventRow>(&query)
            .bind(input.server_node_id)
            .bind(input.event_type.as_str())
            .bind(&input.message)
            .fetch_one(pool)
            .await
    }

    /// Events for one node, oldest first.
    pub async fn list_for_node(
        pool: &PgPool,
        server_node_id: DbId,
    ) -> Result<Vec<ServerNodeEventRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM server_node_events WHERE server_node_id = $1 ORDER BY id ASC"
        );
        sqlx::query_as::<_, ServerNodeEventRow>(&query)
            .bind(server_node_id)
            .fetch_all(pool)
            .await
    }
}
