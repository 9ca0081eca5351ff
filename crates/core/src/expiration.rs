//! Lease time-left computation.
//!
//! The rules are evaluated in order and the first match wins:
//!
//! 1. Remote nodes never expire.
//! 2. A node with a lifecycle owner expires `extra_timeout` after creation when
//!    a lease is attached (may go negative), otherwise `life_expectancy` after
//!    creation (floored at zero).
//! 3. A busy node without a lifecycle owner is in an unstable state and is
//!    treated as already expired.
//! 4. Anything else is idle and not tracked.
//!
//! A lifetime too large to land on a representable instant saturates, so an
//! effectively unbounded lease reports the largest time left instead of
//! overflowing.

use std::fmt;

use chrono::Duration;

use crate::node::{Lease, LifecycleOwner, NodeRecord};
use crate::types::Timestamp;

/// Remaining lease time for a tracked node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLeft {
    /// The node never expires.
    Infinite,
    /// Time until expiry; zero or negative means expired.
    Finite(Duration),
}

impl TimeLeft {
    pub fn is_elapsed(&self) -> bool {
        match self {
            Self::Infinite => false,
            Self::Finite(left) => *left <= Duration::zero(),
        }
    }

    /// Milliseconds left, saturating `Infinite` to `i64::MAX`.
    pub fn as_millis(&self) -> i64 {
        match self {
            Self::Infinite => i64::MAX,
            Self::Finite(left) => left.num_milliseconds(),
        }
    }
}

/// Which expiration rule applied to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Remote,
    /// Owned and leased; the lease timeout applies and may be negative.
    Leased { time_left: Duration },
    /// Owned without a lease; the owner's life expectancy applies.
    Owned { time_left: Duration },
    /// Busy without a lifecycle owner.
    Unstable,
    /// Idle and unowned; not aging out.
    Untracked,
}

impl LeaseState {
    pub fn time_left(&self) -> Option<TimeLeft> {
        match self {
            Self::Remote => Some(TimeLeft::Infinite),
            Self::Leased { time_left } | Self::Owned { time_left } => {
                Some(TimeLeft::Finite(*time_left))
            }
            Self::Unstable => Some(TimeLeft::Finite(Duration::zero())),
            Self::Untracked => None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.time_left().is_some_and(|left| left.is_elapsed())
    }
}

/// A node together with its resolved associations.
#[derive(Debug, Clone, Copy)]
pub struct NodeLease<'a> {
    pub node: &'a NodeRecord,
    pub lease: Option<&'a Lease>,
    pub owner: Option<&'a LifecycleOwner>,
}

impl<'a> NodeLease<'a> {
    pub fn new(
        node: &'a NodeRecord,
        lease: Option<&'a Lease>,
        owner: Option<&'a LifecycleOwner>,
    ) -> Self {
        Self { node, lease, owner }
    }

    /// Classify the node at `now`.
    ///
    /// Logs an error-level diagnostic when the node is busy without an owner.
    pub fn state(&self, now: Timestamp) -> LeaseState {
        let node = self.node;
        if node.remote {
            return LeaseState::Remote;
        }

        match (self.owner, self.lease) {
            (Some(_), Some(lease)) => LeaseState::Leased {
                time_left: time_until(node.creation_time, lease.extra_timeout(), now),
            },
            (Some(owner), None) => LeaseState::Owned {
                time_left: time_until(node.creation_time, owner.life_expectancy(), now)
                    .max(Duration::zero()),
            },
            (None, _) if node.busy => {
                tracing::error!(
                    node_id = node.id,
                    server_id = node.server_id.as_deref().unwrap_or_default(),
                    public_ip = node.public_ip.as_deref().unwrap_or_default(),
                    private_ip = node.private_ip.as_deref().unwrap_or_default(),
                    "unstable status - lifecycle owner is missing but node is marked busy, expiring node"
                );
                LeaseState::Unstable
            }
            (None, _) => LeaseState::Untracked,
        }
    }

    /// Remaining lease time, or `None` when the node is not tracked.
    pub fn time_left(&self, now: Timestamp) -> Option<TimeLeft> {
        self.state(now).time_left()
    }

    /// A node with no tracked time left is never expired.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.state(now).is_expired()
    }

    /// Renders the node like its `Display` impl plus `expirationTime`, the
    /// milliseconds left at `now` (`infinite` for remote nodes, `none` when
    /// untracked).
    pub fn display_at(&self, now: Timestamp) -> DisplayAt<'a> {
        DisplayAt {
            node: self.node,
            time_left: self.time_left(now),
        }
    }
}

/// Helper returned by [`NodeLease::display_at`].
pub struct DisplayAt<'a> {
    node: &'a NodeRecord,
    time_left: Option<TimeLeft>,
}

impl fmt::Display for DisplayAt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis;
        let expiration: &dyn fmt::Display = match self.time_left {
            Some(TimeLeft::Infinite) => &"infinite",
            Some(TimeLeft::Finite(left)) => {
                millis = left.num_milliseconds();
                &millis
            }
            None => &"none",
        };
        self.node.render(f, Some(expiration))
    }
}

/// Time from `now` until `start + lifetime`, saturating at the duration
/// bounds when the deadline is out of range.
fn time_until(start: Timestamp, lifetime: Duration, now: Timestamp) -> Duration {
    match start.checked_add_signed(lifetime) {
        Some(deadline) => deadline.signed_duration_since(now),
        None if lifetime < Duration::zero() => Duration::MIN,
        None => Duration::MAX,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
