//! Executor side of the script queue.
//!
//! Claims descriptors from `_scripts/new/`, runs them to completion and
//! reports each result as a status artifact. A job that cannot be started
//! still gets an artifact (exit status `-1`) so pollers are never left
//! waiting on a job this executor has already given up on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nodefleet_core::error::CoreError;
use nodefleet_core::node::NodeRecord;
use nodefleet_core::registry::NodeRegistry;
use nodefleet_core::scripting::subprocess::{run_command, CommandOutput, CommandSpec};
use nodefleet_core::scripting::{
    ClaimedJob, JobDescriptor, ScriptError, ScriptJobQueue, StatusArtifact, CLOUDIFY_HOME_ENV,
    PRIVATE_KEY_FILE_ENV,
};
use nodefleet_core::types::DbId;
use tokio_util::sync::CancellationToken;

/// Exit status reported when the executable never ran.
pub const LAUNCH_FAILURE_EXIT_STATUS: i32 = -1;

/// Longest stderr excerpt carried into a failure artifact.
const MAX_EXCEPTION_CHARS: usize = 4096;

pub struct ScriptRunner {
    queue: ScriptJobQueue,
    registry: NodeRegistry,
}

impl ScriptRunner {
    pub fn new(queue: ScriptJobQueue, registry: NodeRegistry) -> Self {
        Self { queue, registry }
    }

    pub fn queue(&self) -> &ScriptJobQueue {
        &self.queue
    }

    /// Claim and execute every pending job. Returns how many this runner ran.
    pub async fn run_pending(&self) -> Result<usize, ScriptError> {
        let mut executed = 0;
        while let Some(job) = self.queue.claim_next().await? {
            self.execute(&job).await?;
            executed += 1;
        }
        Ok(executed)
    }

    /// Run one claimed job and publish its status artifact.
    pub async fn execute(&self, job: &ClaimedJob) -> Result<StatusArtifact, ScriptError> {
        let descriptor = &job.descriptor;
        tracing::info!(
            server_node_id = %descriptor.server_node_id,
            command = %descriptor.command,
            executable = %descriptor.executable,
            "Running script job"
        );

        let artifact = self.run_descriptor(descriptor).await;
        self.queue.complete(job, &artifact).await?;
        Ok(artifact)
    }

    /// Poll the queue every `interval` until `cancel` fires.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        if let Err(e) = self.queue.init().await {
            tracing::error!(error = %e, "Script runner: cannot create queue folders");
            return;
        }

        tracing::info!(
            scripts_dir = %self.queue.scripts_dir().display(),
            interval_secs = interval.as_secs(),
            "Script runner started"
        );

        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Script runner stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_pending().await {
                        Ok(0) => tracing::debug!("Script runner: no pending jobs"),
                        Ok(executed) => tracing::info!(executed, "Script runner: batch finished"),
                        Err(e) => tracing::error!(error = %e, "Script runner: batch failed"),
                    }
                }
            }
        }
    }

    // ── Execution ────────────────────────────────────────────────────────

    async fn run_descriptor(&self, descriptor: &JobDescriptor) -> StatusArtifact {
        let mut spec = CommandSpec::new(&descriptor.executable).args(&descriptor.arguments);
        if let Some(home) = &descriptor.cloudify_home {
            spec = spec.env(CLOUDIFY_HOME_ENV, home);
        }
        if let Some(folder) = &descriptor.cloud_folder {
            spec = spec.current_dir(folder);
        }

        let key_file = if descriptor.handle_private_key {
            match self.materialize_private_key(descriptor).await {
                Ok(path) => {
                    spec = spec.env(PRIVATE_KEY_FILE_ENV, path.to_string_lossy());
                    Some(path)
                }
                Err(message) => {
                    tracing::error!(
                        server_node_id = %descriptor.server_node_id,
                        reason = %message,
                        "Cannot prepare private key"
                    );
                    return StatusArtifact::failure(LAUNCH_FAILURE_EXIT_STATUS, message);
                }
            }
        } else {
            None
        };

        let artifact = match run_command(&spec).await {
            Ok(output) => artifact_for(&output),
            Err(e) => {
                tracing::error!(
                    server_node_id = %descriptor.server_node_id,
                    error = %e,
                    "Script job failed to launch"
                );
                StatusArtifact::failure(LAUNCH_FAILURE_EXIT_STATUS, e.to_string())
            }
        };

        if let Some(path) = key_file {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove key file");
            }
        }

        artifact
    }

    /// Write the first addressed node's private key to
    /// `<cloudFolder>/<firstNodeId>.pem` with owner-only permissions.
    async fn materialize_private_key(&self, descriptor: &JobDescriptor) -> Result<PathBuf, String> {
        let folder = descriptor
            .cloud_folder
            .as_deref()
            .ok_or("handlePrivateKey requires a cloudFolder")?;
        let first = descriptor
            .node_ids()
            .first()
            .copied()
            .ok_or("serverNodeId names no node")?;

        let node = self
            .resolve_node(first)
            .await
            .map_err(|e| format!("lookup of node {first} failed: {e}"))?
            .ok_or_else(|| format!("node {first} not found"))?;
        let key = node
            .private_key
            .as_deref()
            .ok_or_else(|| format!("node {first} has no private key"))?;

        let path = Path::new(folder).join(format!("{first}.pem"));
        write_key_file(&path, key)
            .await
            .map_err(|e| format!("cannot write {}: {e}", path.display()))?;
        Ok(path)
    }

    /// Node ids in descriptors are registry ids; anything non-numeric is
    /// taken as a provider server id.
    async fn resolve_node(&self, node_id: &str) -> Result<Option<NodeRecord>, CoreError> {
        match node_id.parse::<DbId>() {
            Ok(id) => self.registry.find(id).await,
            Err(_) => self.registry.find_by_node_id(node_id).await,
        }
    }
}

/// Translate a finished process into its status artifact.
fn artifact_for(output: &CommandOutput) -> StatusArtifact {
    if output.success() {
        tracing::info!(duration_ms = output.duration_ms, "Script job succeeded");
        return StatusArtifact::success();
    }

    let stderr = output.stderr.trim();
    let message = if stderr.is_empty() {
        format!("Process exited with status {}", output.exit_code)
    } else {
        stderr.chars().take(MAX_EXCEPTION_CHARS).collect()
    };
    tracing::warn!(
        exit_code = output.exit_code,
        duration_ms = output.duration_ms,
        "Script job failed"
    );
    StatusArtifact::failure(output.exit_code, message)
}

async fn write_key_file(path: &Path, key: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(key.as_bytes()).await?;
    file.flush().await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
