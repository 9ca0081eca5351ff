//! Repository for the `server_nodes` table.
//!
//! Updates and deletes are conditional on `version`; a `None` or zero-row
//! result means the row is missing or was changed by someone else, and the
//! caller decides which by re-reading [`ServerNodeRepo::current_version`].

use nodefleet_core::criteria::{FieldValue, NodeQuery, Predicate};
use nodefleet_core::node::{CreateNode, NodeRecord};
use nodefleet_core::types::{DbId, Version};
use sqlx::PgPool;

use crate::models::server_node::ServerNodeRow;

/// Column list for `server_nodes` queries.
const COLUMNS: &str = "\
    id, server_id, api_key, project, public_ip, private_ip, busy, stopped, remote, \
    private_key, owner_id, lease_id, lifecycle_owner_id, creation_time, version";

/// Provides versioned CRUD and filtered queries for server nodes.
pub struct ServerNodeRepo;

impl ServerNodeRepo {
    // ── Creation ─────────────────────────────────────────────────────────

    pub async fn create(pool: &PgPool, input: &CreateNode) -> Result<ServerNodeRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO server_nodes (server_id, public_ip, private_ip, creation_time)
             VALUES ($1, $2, $3, $4)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ServerNodeRow>(&query)
            .bind(&input.server_id)
            .bind(&input.public_ip)
            .bind(&input.private_ip)
            .bind(input.creation_time)
            .fetch_one(pool)
            .await
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<ServerNodeRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM server_nodes WHERE id = $1");
        sqlx::query_as::<_, ServerNodeRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Lowest-id node carrying the given provider id.
    pub async fn find_by_server_id(
        pool: &PgPool,
        server_id: &str,
    ) -> Result<Option<ServerNodeRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM server_nodes WHERE server_id = $1 ORDER BY id ASC LIMIT 1"
        );
        sqlx::query_as::<_, ServerNodeRow>(&query)
            .bind(server_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_lifecycle_owner(
        pool: &PgPool,
        lifecycle_owner_id: DbId,
    ) -> Result<Option<ServerNodeRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM server_nodes WHERE lifecycle_owner_id = $1");
        sqlx::query_as::<_, ServerNodeRow>(&query)
            .bind(lifecycle_owner_id)
            .fetch_optional(pool)
            .await
    }

    /// Nodes matching `query`, ordered by id and capped at `max_rows`.
    pub async fn query(pool: &PgPool, query: &NodeQuery) -> Result<Vec<ServerNodeRow>, sqlx::Error> {
        let (where_clause, mut bind_values, bind_idx) = build_node_filter(&query.to_predicate());

        let mut sql = format!("SELECT {COLUMNS} FROM server_nodes {where_clause} ORDER BY id ASC");
        if let Some(limit) = query.max_rows {
            sql.push_str(&format!(" LIMIT ${bind_idx}"));
            bind_values.push(BindValue::BigInt(limit as i64));
        }

        let q = sqlx::query_as::<_, ServerNodeRow>(&sql);
        bind_node_values(q, &bind_values).fetch_all(pool).await
    }

    pub async fn count(pool: &PgPool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM server_nodes")
            .fetch_one(pool)
            .await
    }

    pub async fn list_all(pool: &PgPool) -> Result<Vec<ServerNodeRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM server_nodes ORDER BY id ASC");
        sqlx::query_as::<_, ServerNodeRow>(&query)
            .fetch_all(pool)
            .await
    }

    /// Stored version of a node, or `None` if it does not exist.
    pub async fn current_version(pool: &PgPool, id: DbId) -> Result<Option<Version>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT version FROM server_nodes WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    // ── Mutations ────────────────────────────────────────────────────────

    /// Write every mutable column and bump `version`, only if the stored
    /// version equals `expected_version`.
    pub async fn update_versioned(
        pool: &PgPool,
        node: &NodeRecord,
        expected_version: Version,
    ) -> Result<Option<ServerNodeRow>, sqlx::Error> {
        let query = format!(
            "UPDATE server_nodes SET
                server_id = $3,
                api_key = $4,
                project = $5,
                public_ip = $6,
                private_ip = $7,
                busy = $8,
                stopped = $9,
                remote = $10,
                private_key = $11,
                owner_id = $12,
                lease_id = $13,
                lifecycle_owner_id = $14,
                version = version + 1
             WHERE id = $1 AND version = $2
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ServerNodeRow>(&query)
            .bind(node.id)
            .bind(expected_version)
            .bind(&node.server_id)
            .bind(&node.key)
            .bind(&node.project)
            .bind(&node.public_ip)
            .bind(&node.private_ip)
            .bind(node.busy)
            .bind(node.stopped)
            .bind(node.remote)
            .bind(&node.private_key)
            .bind(node.owner_id)
            .bind(node.lease_id)
            .bind(node.lifecycle_owner_id)
            .fetch_optional(pool)
            .await
    }

    /// Detach a node's lifecycle owner, then delete it (its events cascade),
    /// in one transaction. Returns `false` without touching the row when the
    /// version does not match.
    pub async fn delete_versioned(
        pool: &PgPool,
        id: DbId,
        expected_version: Version,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let detached = sqlx::query(
            "UPDATE server_nodes SET lifecycle_owner_id = NULL, version = version + 1 \
             WHERE id = $1 AND version = $2",
        )
        .bind(id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;
        if detached.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM server_nodes WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Dynamic filter helpers
// ---------------------------------------------------------------------------

/// A typed bind parameter for dynamic node queries.
#[derive(Debug, Clone, PartialEq)]
enum BindValue {
    Bool(bool),
    BigInt(i64),
    Text(String),
}

impl From<&FieldValue> for BindValue {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Bool(v) => Self::Bool(*v),
            FieldValue::Id(v) => Self::BigInt(*v),
            FieldValue::Text(v) => Self::Text(v.clone()),
        }
    }
}

/// Render a predicate into a `WHERE` clause and its bind values.
///
/// Returns `(where_clause, bind_values, next_bind_idx)`; the clause is empty
/// when the predicate places no restriction.
fn build_node_filter(predicate: &Predicate) -> (String, Vec<BindValue>, u32) {
    let mut bind_idx = 1u32;
    let mut bind_values = Vec::new();

    if *predicate == Predicate::True {
        return (String::new(), bind_values, bind_idx);
    }

    let condition = render_predicate(predicate, &mut bind_idx, &mut bind_values);
    (format!("WHERE {condition}"), bind_values, bind_idx)
}

fn render_predicate(
    predicate: &Predicate,
    bind_idx: &mut u32,
    bind_values: &mut Vec<BindValue>,
) -> String {
    match predicate {
        Predicate::True => "TRUE".to_string(),
        Predicate::Eq(field, value) => {
            let sql = format!("{} = ${}", field.column(), bind_idx);
            *bind_idx += 1;
            bind_values.push(value.into());
            sql
        }
        Predicate::IsNull(field) => format!("{} IS NULL", field.column()),
        Predicate::IsNotNull(field) => format!("{} IS NOT NULL", field.column()),
        Predicate::And(terms) => join_terms(terms, " AND ", "TRUE", bind_idx, bind_values),
        Predicate::Or(terms) => join_terms(terms, " OR ", "FALSE", bind_idx, bind_values),
    }
}

fn join_terms(
    terms: &[Predicate],
    separator: &str,
    empty: &str,
    bind_idx: &mut u32,
    bind_values: &mut Vec<BindValue>,
) -> String {
    if terms.is_empty() {
        return empty.to_string();
    }
    let rendered: Vec<String> = terms
        .iter()
        .map(|t| render_predicate(t, bind_idx, bind_values))
        .collect();
    format!("({})", rendered.join(separator))
}

/// Bind a slice of `BindValue` to a sqlx `QueryAs`.
fn bind_node_values<'q, O>(
    mut q: sqlx::query::QueryAs<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments>,
    bind_values: &'q [BindValue],
) -> sqlx::query::QueryAs<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments> {
    for val in bind_values {
        match val {
            BindValue::Bool(v) => q = q.bind(*v),
            BindValue::BigInt(v) => q = q.bind(*v),
            BindValue::Text(v) => q = q.bind(v.as_str()),
        }
    }
    q
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
