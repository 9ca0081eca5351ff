//! Status artifacts: the only completion signal a script job produces.
//!
//! An artifact is a small JSON document `{"exitStatus": <int>}` with an
//! `exception` string added on failure. Readers treat an absent artifact as
//! "still pending or unknown".

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{ScriptError, OUTPUT_FILE_NAME_PREFIX, STATUS_SUFFIX};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusArtifact {
    pub exit_status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl StatusArtifact {
    pub fn success() -> Self {
        Self {
            exit_status: 0,
            exception: None,
        }
    }

    pub fn failure(exit_status: i32, exception: impl Into<String>) -> Self {
        Self {
            exit_status,
            exception: Some(exception.into()),
        }
    }

    /// A non-zero exit or any `exception` text means failure.
    pub fn outcome(&self) -> JobOutcome {
        if self.exit_status == 0 && self.exception.is_none() {
            JobOutcome::Succeeded
        } else {
            JobOutcome::Failed(ExecutionFailure {
                exit_status: self.exit_status,
                message: self.exception.clone(),
            })
        }
    }
}

/// Terminal result of a script job as reported by its artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(ExecutionFailure),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn into_result(self) -> Result<(), ExecutionFailure> {
        match self {
            Self::Succeeded => Ok(()),
            Self::Failed(failure) => Err(failure),
        }
    }
}

/// A failed job. `message` is the executor's error text, uninterpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub exit_status: i32,
    pub message: Option<String>,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "Script failed with exit status {}: {msg}", self.exit_status),
            None => write!(f, "Script failed with exit status {}", self.exit_status),
        }
    }
}

impl std::error::Error for ExecutionFailure {}

/// `output-nodeid-<serverNodeId>_status.json`
pub fn status_file_name(server_node_id: &str) -> String {
    format!("{OUTPUT_FILE_NAME_PREFIX}{server_node_id}{STATUS_SUFFIX}")
}

/// Inverse of [`status_file_name`].
pub fn parse_status_file_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(OUTPUT_FILE_NAME_PREFIX)?
        .strip_suffix(STATUS_SUFFIX)
        .filter(|id| !id.is_empty())
}

pub fn status_path(dir: &Path, server_node_id: &str) -> PathBuf {
    dir.join(status_file_name(server_node_id))
}

/// Read the artifact at `path`; `None` if it does not exist yet.
pub async fn read_status(path: &Path) -> Result<Option<StatusArtifact>, ScriptError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ScriptError::Io(e)),
    }
}

/// Write the artifact for `server_node_id` into `dir`, replacing any old one.
///
/// The JSON is written to a temporary sibling first and renamed into place,
/// so pollers never observe a partial document.
pub async fn write_status(
    dir: &Path,
    server_node_id: &str,
    artifact: &StatusArtifact,
) -> Result<PathBuf, ScriptError> {
    let path = status_path(dir, server_node_id);
    let tmp = dir.join(format!(
        ".{}.{}.tmp",
        status_file_name(server_node_id),
        uuid::Uuid::new_v4()
    ));
    tokio::fs::write(&tmp, serde_json::to_vec(artifact)?).await?;
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ScriptError::Io(e));
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
