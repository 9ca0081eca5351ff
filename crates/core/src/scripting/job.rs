//! Job descriptors and compound node ids.

use serde::{Deserialize, Serialize};

use super::command::ScriptCommand;
use super::{ScriptError, SERVER_NODE_ID_DELIMITER};

/// Queue file name of the `command` descriptor for `server_node_id`.
pub fn descriptor_file_name(command: ScriptCommand, server_node_id: &str) -> String {
    format!("{command}-{server_node_id}.json")
}

/// A request to run one provisioning command against a node.
///
/// Serialized as a JSON property bag with the field names the executor
/// expects (`serverNodeId`, `executable`, `arguments`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    /// Target node id, or several joined with `_` when they share a host.
    pub server_node_id: String,
    pub command: ScriptCommand,
    /// Interpreter or binary to run.
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Whether the executor must write the node's private key to disk first.
    #[serde(default)]
    pub handle_private_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudify_home: Option<String>,
    /// Per-job scratch folder; also the child's working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_folder: Option<String>,
}

impl JobDescriptor {
    pub fn new(
        server_node_id: impl Into<String>,
        command: ScriptCommand,
        executable: impl Into<String>,
    ) -> Self {
        Self {
            server_node_id: server_node_id.into(),
            command,
            executable: executable.into(),
            arguments: Vec::new(),
            handle_private_key: false,
            cloudify_home: None,
            cloud_folder: None,
        }
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_private_key(mut self, handle: bool) -> Self {
        self.handle_private_key = handle;
        self
    }

    pub fn with_cloudify_home(mut self, path: impl Into<String>) -> Self {
        self.cloudify_home = Some(path.into());
        self
    }

    pub fn with_cloud_folder(mut self, path: impl Into<String>) -> Self {
        self.cloud_folder = Some(path.into());
        self
    }

    /// Queue file name, unique per (node id, command).
    pub fn file_name(&self) -> String {
        descriptor_file_name(self.command, &self.server_node_id)
    }

    /// The logical node ids this job addresses.
    pub fn node_ids(&self) -> Vec<&str> {
        split_node_ids(&self.server_node_id)
    }

    /// Reject descriptors that cannot be named safely or cannot run.
    pub fn validate(&self) -> Result<(), ScriptError> {
        let id = &self.server_node_id;
        if id.is_empty() {
            return Err(ScriptError::InvalidDescriptor(
                "serverNodeId must not be empty".to_string(),
            ));
        }
        if id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(ScriptError::InvalidDescriptor(format!(
                "serverNodeId {id:?} is not a valid file name component"
            )));
        }
        if self.executable.trim().is_empty() {
            return Err(ScriptError::InvalidDescriptor(
                "executable must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Join logical node ids that share one physical host.
pub fn join_node_ids<S: AsRef<str>>(ids: &[S]) -> String {
    ids.iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(SERVER_NODE_ID_DELIMITER)
}

/// Split a compound server node id into its logical node ids.
pub fn split_node_ids(compound: &str) -> Vec<&str> {
    compound
        .split(SERVER_NODE_ID_DELIMITER)
        .filter(|id| !id.is_empty())
        .collect()
}
