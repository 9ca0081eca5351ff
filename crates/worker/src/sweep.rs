//! Periodic reclamation of expired nodes.
//!
//! Each pass lists the non-remote nodes, then for every candidate re-reads
//! the node, re-checks expiry and reclaims it with the version it just read.
//! A version conflict restarts that cycle, up to `max_attempts` times, so a
//! node that was leased between the listing and the reclaim survives.

use std::time::Duration;

use chrono::Utc;
use nodefleet_core::criteria::{NodeCriteria, NodeQuery};
use nodefleet_core::error::CoreError;
use nodefleet_core::registry::NodeRegistry;
use nodefleet_core::types::{DbId, Timestamp};
use tokio_util::sync::CancellationToken;

/// Outcome counters for one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Non-remote nodes examined.
    pub scanned: usize,
    pub reclaimed: usize,
    /// Nodes skipped after exhausting retries on version conflicts.
    pub conflicts: usize,
    pub errors: usize,
}

pub struct ExpirationSweep {
    registry: NodeRegistry,
    max_attempts: u32,
}

impl ExpirationSweep {
    pub fn new(registry: NodeRegistry, max_attempts: u32) -> Self {
        Self {
            registry,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run one pass evaluated at `now`.
    pub async fn sweep_once(&self, now: Timestamp) -> Result<SweepReport, CoreError> {
        let query = NodeQuery::new().criteria(NodeCriteria::new().remote(false));
        let candidates = self.registry.query(&query).await?;

        let mut report = SweepReport {
            scanned: candidates.len(),
            ..SweepReport::default()
        };

        for node in candidates {
            match self.reclaim_if_expired(node.id, now).await {
                Ok(true) => report.reclaimed += 1,
                Ok(false) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        node_id = node.id,
                        attempts = self.max_attempts,
                        error = %e,
                        "Sweep: giving up on node after version conflicts"
                    );
                    report.conflicts += 1;
                }
                Err(e) => {
                    tracing::error!(node_id = node.id, error = %e, "Sweep: reclaim failed");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Reclaim node `id` if it is expired at `now`. Returns whether it was.
    pub async fn reclaim_if_expired(&self, id: DbId, now: Timestamp) -> Result<bool, CoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let Some(node) = self.registry.find(id).await? else {
                return Ok(false);
            };
            if !self.registry.is_expired(&node, now).await? {
                return Ok(false);
            }

            match self.registry.reclaim(node.id, node.version).await {
                Ok(()) => {
                    tracing::info!(
                        node_id = node.id,
                        server_id = node.server_id.as_deref().unwrap_or_default(),
                        attempt,
                        "Sweep: reclaimed expired node"
                    );
                    return Ok(true);
                }
                // Someone else deleted it first.
                Err(CoreError::NotFound { .. }) => return Ok(false),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    tracing::debug!(node_id = id, attempt, "Sweep: version conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = interval.as_secs(),
            max_attempts = self.max_attempts,
            "Expiration sweep started"
        );

        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Expiration sweep stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) if report.reclaimed > 0 || report.conflicts > 0 || report.errors > 0 => {
                            tracing::info!(?report, "Expiration sweep: pass finished");
                        }
                        Ok(report) => {
                            tracing::debug!(scanned = report.scanned, "Expiration sweep: nothing expired");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Expiration sweep: pass failed");
                        }
                    }
                }
            }
        }
    }
}
