//! Shared scalar aliases.

/// Surrogate keys for nodes, events, leases and lifecycle owners (BIGSERIAL).
pub type DbId = i64;

/// Creation times and event timestamps, always UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Optimistic-concurrency counter carried by every versioned record.
pub type Version = i64;
