//! `leases` and `lifecycle_owners` rows.

use nodefleet_core::node::{Lease, LifecycleOwner};
use nodefleet_core::types::{DbId, Timestamp};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct LeaseRow {
    pub id: DbId,
    pub extra_timeout_ms: i64,
    pub created_at: Timestamp,
}

impl From<LeaseRow> for Lease {
    fn from(row: LeaseRow) -> Self {
        Self {
            id: row.id,
            extra_timeout_ms: row.extra_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct LifecycleOwnerRow {
    pub id: DbId,
    pub life_expectancy_ms: i64,
    pub created_at: Timestamp,
}

impl From<LifecycleOwnerRow> for LifecycleOwner {
    fn from(row: LifecycleOwnerRow) -> Self {
        Self {
            id: row.id,
            life_expectancy_ms: row.life_expectancy_ms,
        }
    }
}
