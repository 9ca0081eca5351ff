//! Leased compute node records and their associations.
//!
//! A [`NodeRecord`] refers to its lease and lifecycle owner by id only; the
//! registry resolves those references when expiration has to be computed.

use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::types::{DbId, Timestamp, Version};

// ---------------------------------------------------------------------------
// Node record
// ---------------------------------------------------------------------------

/// One leased compute node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: DbId,
    /// Cloud-provider identifier; `None` while the node is a placeholder.
    pub server_id: Option<String>,
    /// Secret lookup key, paired with `project`.
    pub key: Option<String>,
    pub project: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub busy: bool,
    pub stopped: bool,
    /// Manually managed node, exempt from lease expiration.
    pub remote: bool,
    #[serde(skip_serializing)]
    pub private_key: Option<String>,
    /// User the node was handed to, used for non-admin query scoping.
    pub owner_id: Option<DbId>,
    pub lease_id: Option<DbId>,
    pub lifecycle_owner_id: Option<DbId>,
    pub creation_time: Timestamp,
    pub version: Version,
}

impl NodeRecord {
    /// Build an unsaved event linked to this node at INFO severity.
    pub fn info_event(&self, message: impl Into<String>) -> CreateNodeEvent {
        self.create_event(message, NodeEventType::Info)
    }

    /// Build an unsaved event linked to this node at ERROR severity.
    pub fn error_event(&self, message: impl Into<String>) -> CreateNodeEvent {
        self.create_event(message, NodeEventType::Error)
    }

    pub fn create_event(
        &self,
        message: impl Into<String>,
        event_type: NodeEventType,
    ) -> CreateNodeEvent {
        let message = message.into();
        tracing::info!(node_id = self.id, %event_type, %message, "adding node event");
        CreateNodeEvent {
            server_node_id: self.id,
            event_type,
            message,
        }
    }

    /// Cache token under which the node's secret key is stored.
    ///
    /// `None` when either half of the `(project, key)` pair is missing.
    pub fn secret_key_token(&self) -> Option<(String, String)> {
        match (&self.project, &self.key) {
            (Some(project), Some(key)) => Some((project.clone(), key.clone())),
            _ => None,
        }
    }
}

impl NodeRecord {
    /// Debug rendering, with `expirationTime` included when it is known.
    pub(crate) fn render(
        &self,
        f: &mut fmt::Formatter<'_>,
        expiration_time: Option<&dyn fmt::Display>,
    ) -> fmt::Result {
        write!(
            f,
            "ServerNode{{id={}, serverId='{}', ",
            self.id,
            self.server_id.as_deref().unwrap_or_default(),
        )?;
        if let Some(expiration_time) = expiration_time {
            write!(f, "expirationTime={expiration_time}, ")?;
        }
        write!(
            f,
            "publicIP='{}', privateIP='{}', busy={}, remote={}, project='{}'}}",
            self.public_ip.as_deref().unwrap_or_default(),
            self.private_ip.as_deref().unwrap_or_default(),
            self.busy,
            self.remote,
            self.project.as_deref().unwrap_or_default(),
        )
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, None)
    }
}

/// Identity and addresses returned by the cloud provider for a new server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

impl ServerInfo {
    pub fn new(
        server_id: impl Into<String>,
        public_ip: Option<String>,
        private_ip: Option<String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            public_ip,
            private_ip,
        }
    }
}

/// DTO for inserting a new node. Flags start cleared and `version` at zero.
#[derive(Debug, Clone)]
pub struct CreateNode {
    pub server_id: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub creation_time: Timestamp,
}

impl CreateNode {
    pub fn from_server(info: ServerInfo, creation_time: Timestamp) -> Self {
        Self {
            server_id: Some(info.server_id),
            public_ip: info.public_ip,
            private_ip: info.private_ip,
            creation_time,
        }
    }

    pub fn placeholder(creation_time: Timestamp) -> Self {
        Self {
            server_id: None,
            public_ip: None,
            private_ip: None,
            creation_time,
        }
    }
}

// ---------------------------------------------------------------------------
// Associations
// ---------------------------------------------------------------------------

/// A lease grant carrying a custom timeout that overrides the owner's default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: DbId,
    pub extra_timeout_ms: i64,
}

impl Lease {
    pub fn extra_timeout(&self) -> Duration {
        saturating_millis(self.extra_timeout_ms)
    }
}

/// The widget instance whose life expectancy drives default expiration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleOwner {
    pub id: DbId,
    pub life_expectancy_ms: i64,
}

impl LifecycleOwner {
    pub fn life_expectancy(&self) -> Duration {
        saturating_millis(self.life_expectancy_ms)
    }
}

/// `i64::MIN` ms is outside chrono's range; clamp instead of panicking.
fn saturating_millis(ms: i64) -> Duration {
    Duration::try_milliseconds(ms).unwrap_or(if ms < 0 { Duration::MIN } else { Duration::MAX })
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Severity of a node event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeEventType {
    Info,
    Error,
}

impl NodeEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INFO" => Some(Self::Info),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for NodeEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unsaved event, already linked to its node, waiting to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateNodeEvent {
    pub server_node_id: DbId,
    pub event_type: NodeEventType,
    pub message: String,
}

/// A persisted entry of a node's append-only event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub id: DbId,
    pub server_node_id: DbId,
    pub event_type: NodeEventType,
    pub message: String,
    pub created_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_helpers {
    use chrono::{DateTime, Utc};

    use super::NodeRecord;

    /// Millisecond epoch timestamp, for readable expiration arithmetic.
    pub fn at_ms(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).expect("valid timestamp")
    }

    /// An idle, unowned node created at `created_ms`.
    pub fn node(id: i64, created_ms: i64) -> NodeRecord {
        NodeRecord {
            id,
            server_id: Some(format!("srv-{id}")),
            key: None,
            project: None,
            public_ip: Some("203.0.113.10".into()),
            private_ip: Some("10.0.0.10".into()),
            busy: false,
            stopped: false,
            remote: false,
            private_key: None,
            owner_id: None,
            lease_id: None,
            lifecycle_owner_id: None,
            creation_time: at_ms(created_ms),
            version: 0,
        }
    }
}
