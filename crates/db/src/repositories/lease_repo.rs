//! Repository for the `leases` and `lifecycle_owners` tables.

use nodefleet_core::types::DbId;
use sqlx::PgPool;

use crate::models::lease::{LeaseRow, LifecycleOwnerRow};

const LEASE_COLUMNS: &str = "id, extra_timeout_ms, created_at";

const OWNER_COLUMNS: &str = "id, life_expectancy_ms, created_at";

pub struct LeaseRepo;

impl LeaseRepo {
    // ── Leases ───────────────────────────────────────────────────────────

    pub async fn create_lease(pool: &PgPool, extra_timeout_ms: i64) -> Result<LeaseRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO leases (extra_timeout_ms) VALUES ($1) RETURNING {LEASE_COLUMNS}"
        );
        sqlx::query_as::<_, LeaseRow>(&query)
            .bind(extra_timeout_ms)
            .fetch_one(pool)
            .await
    }

    pub async fn find_lease(pool: &PgPool, id: DbId) -> Result<Option<LeaseRow>, sqlx::Error> {
        let query = format!("SELECT {LEASE_COLUMNS} FROM leases WHERE id = $1");
        sqlx::query_as::<_, LeaseRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    // ── Lifecycle owners ─────────────────────────────────────────────────

    pub async fn create_lifecycle_owner(
        pool: &PgPool,
        life_expectancy_ms: i64,
    ) -> Result<LifecycleOwnerRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO lifecycle_owners (life_expectancy_ms) VALUES ($1) RETURNING {OWNER_COLUMNS}"
        );
        sqlx::query_as::<_, LifecycleOwnerRow>(&query)
            .bind(life_expectancy_ms)
            .fetch_one(pool)
            .await
    }

    pub async fn find_lifecycle_owner(
        pool: &PgPool,
        id: DbId,
    ) -> Result<Option<LifecycleOwnerRow>, sqlx::Error> {
        let query = format!("SELECT {OWNER_COLUMNS} FROM lifecycle_owners WHERE id = $1");
        sqlx::query_as::<_, LifecycleOwnerRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
