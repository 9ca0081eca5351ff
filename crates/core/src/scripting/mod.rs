//! File-based handoff of provisioning scripts to an out-of-process executor.
//!
//! Job descriptors move through `_scripts/new/` and `_scripts/executing/`;
//! completion is signalled only by a status artifact
//! `output-nodeid-<serverNodeId>_status.json` written next to those folders.
//! The claim step (a rename within one volume) is the only synchronization.

pub mod command;
pub mod job;
pub mod queue;
pub mod status;
pub mod subprocess;

use std::fmt;

pub use command::ScriptCommand;
pub use job::{join_node_ids, split_node_ids, JobDescriptor};
pub use queue::{ClaimedJob, JobState, ScriptJobQueue};
pub use status::{ExecutionFailure, JobOutcome, StatusArtifact};

/// Root of the queue tree, relative to the working root.
pub const SCRIPTS_DIR: &str = "_scripts";

/// Submitted, unclaimed descriptors.
pub const NEW_DIR: &str = "new";

/// Claimed, in-flight descriptors.
pub const EXECUTING_DIR: &str = "executing";

pub const OUTPUT_FILE_NAME_PREFIX: &str = "output-nodeid-";

pub const STATUS_SUFFIX: &str = "_status.json";

/// Joins logical node ids that share one physical host.
pub const SERVER_NODE_ID_DELIMITER: &str = "_";

/// Environment variable pointing the script at the provisioning toolkit.
pub const CLOUDIFY_HOME_ENV: &str = "CLOUDIFY_HOME";

/// Environment variable carrying the materialized private key path.
pub const PRIVATE_KEY_FILE_ENV: &str = "NODE_PRIVATE_KEY_FILE";

/// Errors raised by the script queue.
#[derive(Debug)]
pub enum ScriptError {
    /// A job for the same node id is still pending or running. `command` is
    /// the one in flight.
    JobSubmissionConflict {
        server_node_id: String,
        command: ScriptCommand,
    },
    /// No status artifact appeared within the caller's timeout. The job may
    /// still be running or its executor may have died.
    StuckJob {
        server_node_id: String,
        waited_ms: u64,
    },
    /// A descriptor could not be accepted or parsed.
    InvalidDescriptor(String),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JobSubmissionConflict {
                server_node_id,
                command,
            } => write!(
                f,
                "A {command} job for node {server_node_id} is already pending"
            ),
            Self::StuckJob {
                server_node_id,
                waited_ms,
            } => write!(
                f,
                "No status for node {server_node_id} after {waited_ms}ms"
            ),
            Self::InvalidDescriptor(msg) => write!(f, "Invalid job descriptor: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Json(err) => write!(f, "JSON error: {err}"),
        }
    }
}

impl std::error::Error for ScriptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ScriptError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for ScriptError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

/// Shared test helpers for queue tests.
#[cfg(test)]
pub(crate) mod test_helpers {
    use super::{JobDescriptor, ScriptCommand};

    /// A job running `sh -c 'exit 0'` against `node_id`.
    pub fn job(node_id: &str, command: ScriptCommand) -> JobDescriptor {
        JobDescriptor::new(node_id, command, "sh")
            .with_arguments(["-c", "exit 0"])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
