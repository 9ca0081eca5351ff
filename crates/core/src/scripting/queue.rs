//! The `_scripts/` job queue.
//!
//! ```text
//! <working root>/_scripts/
//!   new/          submitted, unclaimed descriptors
//!   executing/    claimed, in-flight descriptors
//!   output-nodeid-<id>_status.json
//! ```
//!
//! Jobs only move forward: NEW -> EXECUTING -> status artifact written.
//! There is no retry and no timeout inside the queue; a job whose executor
//! died stays in `executing/` until an operator intervenes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::fs;

use super::command::ScriptCommand;
use super::job::{descriptor_file_name, JobDescriptor};
use super::status::{self, JobOutcome, StatusArtifact};
use super::{ScriptError, EXECUTING_DIR, NEW_DIR, SCRIPTS_DIR};

/// A descriptor this process won the claim for.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub file_name: String,
    /// Location of the descriptor inside `executing/`.
    pub path: PathBuf,
    pub descriptor: JobDescriptor,
}

/// Where a submitted job currently is, as far as the filesystem shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    New,
    Executing,
    Completed(JobOutcome),
    /// Neither queued nor reported.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ScriptJobQueue {
    scripts_dir: PathBuf,
}

impl ScriptJobQueue {
    /// Queue rooted at `<working_root>/_scripts`.
    pub fn new(working_root: impl AsRef<Path>) -> Self {
        Self {
            scripts_dir: working_root.as_ref().join(SCRIPTS_DIR),
        }
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    pub fn new_dir(&self) -> PathBuf {
        self.scripts_dir.join(NEW_DIR)
    }

    pub fn executing_dir(&self) -> PathBuf {
        self.scripts_dir.join(EXECUTING_DIR)
    }

    /// Create the queue folders if they are missing.
    pub async fn init(&self) -> Result<(), ScriptError> {
        fs::create_dir_all(self.new_dir()).await?;
        fs::create_dir_all(self.executing_dir()).await?;
        Ok(())
    }

    // ── Submission ───────────────────────────────────────────────────────

    /// Enqueue `job` into `new/`.
    ///
    /// The status artifact is keyed by node id alone, so only one job per
    /// node id may be in flight: submission fails with
    /// [`ScriptError::JobSubmissionConflict`] while any descriptor for the
    /// same node id is still in `new/` or `executing/`. Any artifact left
    /// over from an earlier job on that node id is removed so later polls
    /// only see this job's result.
    pub async fn submit(&self, job: &JobDescriptor) -> Result<PathBuf, ScriptError> {
        job.validate()?;
        self.init().await?;

        let conflict = |command| ScriptError::JobSubmissionConflict {
            server_node_id: job.server_node_id.clone(),
            command,
        };
        if let Some(command) = self.in_flight(&job.server_node_id, None).await? {
            return Err(conflict(command));
        }

        remove_if_exists(&self.status_path(&job.server_node_id)).await?;

        // Publish via hard link so the name appears atomically, complete, and
        // only if nobody else published it first.
        let name = job.file_name();
        let target = self.new_dir().join(&name);
        let tmp = self
            .new_dir()
            .join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec_pretty(job)?).await?;
        let linked = fs::hard_link(&tmp, &target).await;
        let _ = fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(conflict(job.command)),
            Err(e) => return Err(ScriptError::Io(e)),
        }

        // A concurrent submitter may have published another command for this
        // node between the check and the link. Both sides back out.
        if let Some(command) = self
            .in_flight(&job.server_node_id, Some(job.command))
            .await?
        {
            remove_if_exists(&target).await?;
            return Err(conflict(command));
        }

        tracing::info!(
            server_node_id = %job.server_node_id,
            command = %job.command,
            path = %target.display(),
            "Script job submitted"
        );
        Ok(target)
    }

    /// The first command with a descriptor for `server_node_id` in `new/` or
    /// `executing/`, skipping `except`.
    async fn in_flight(
        &self,
        server_node_id: &str,
        except: Option<ScriptCommand>,
    ) -> Result<Option<ScriptCommand>, ScriptError> {
        for command in ScriptCommand::ALL {
            if Some(command) == except {
                continue;
            }
            let name = descriptor_file_name(command, server_node_id);
            if fs::try_exists(self.new_dir().join(&name)).await?
                || fs::try_exists(self.executing_dir().join(&name)).await?
            {
                return Ok(Some(command));
            }
        }
        Ok(None)
    }

    // ── Listing ──────────────────────────────────────────────────────────

    /// Descriptor file names waiting in `new/`, sorted.
    pub async fn pending(&self) -> Result<Vec<String>, ScriptError> {
        list_descriptors(&self.new_dir()).await
    }

    /// Descriptor file names currently in `executing/`, sorted.
    pub async fn executing(&self) -> Result<Vec<String>, ScriptError> {
        list_descriptors(&self.executing_dir()).await
    }

    // ── Claiming ─────────────────────────────────────────────────────────

    /// Move `file_name` from `new/` to `executing/`.
    ///
    /// Returns `Ok(None)` when another executor claimed it first. The rename
    /// is atomic within one volume, so at most one claimer succeeds.
    pub async fn claim(&self, file_name: &str) -> Result<Option<ClaimedJob>, ScriptError> {
        let from = self.new_dir().join(file_name);
        let to = self.executing_dir().join(file_name);

        match fs::rename(&from, &to).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(file_name, "Script job already claimed elsewhere");
                return Ok(None);
            }
            Err(e) => return Err(ScriptError::Io(e)),
        }

        let bytes = fs::read(&to).await?;
        let descriptor: JobDescriptor = serde_json::from_slice(&bytes)
            .map_err(|e| ScriptError::InvalidDescriptor(format!("{file_name}: {e}")))?;

        tracing::info!(
            server_node_id = %descriptor.server_node_id,
            command = %descriptor.command,
            "Script job claimed"
        );

        Ok(Some(ClaimedJob {
            file_name: file_name.to_string(),
            path: to,
            descriptor,
        }))
    }

    /// Claim the first pending descriptor this process can win.
    pub async fn claim_next(&self) -> Result<Option<ClaimedJob>, ScriptError> {
        for name in self.pending().await? {
            if let Some(job) = self.claim(&name).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    // ── Completion ───────────────────────────────────────────────────────

    /// Write the job's status artifact, then drop its `executing/` descriptor.
    pub async fn complete(
        &self,
        job: &ClaimedJob,
        artifact: &StatusArtifact,
    ) -> Result<PathBuf, ScriptError> {
        let path =
            status::write_status(&self.scripts_dir, &job.descriptor.server_node_id, artifact)
                .await?;
        remove_if_exists(&job.path).await?;

        tracing::info!(
            server_node_id = %job.descriptor.server_node_id,
            command = %job.descriptor.command,
            exit_status = artifact.exit_status,
            "Script job completed"
        );
        Ok(path)
    }

    // ── Polling ──────────────────────────────────────────────────────────

    pub fn status_path(&self, server_node_id: &str) -> PathBuf {
        status::status_path(&self.scripts_dir, server_node_id)
    }

    /// The reported outcome, or `None` while no artifact exists.
    pub async fn poll(&self, server_node_id: &str) -> Result<Option<JobOutcome>, ScriptError> {
        Ok(status::read_status(&self.status_path(server_node_id))
            .await?
            .map(|artifact| artifact.outcome()))
    }

    /// Where `job` is in its lifecycle.
    pub async fn job_state(&self, job: &JobDescriptor) -> Result<JobState, ScriptError> {
        let name = job.file_name();
        if fs::try_exists(self.new_dir().join(&name)).await? {
            return Ok(JobState::New);
        }
        if fs::try_exists(self.executing_dir().join(&name)).await? {
            return Ok(JobState::Executing);
        }
        Ok(match self.poll(&job.server_node_id).await? {
            Some(outcome) => JobState::Completed(outcome),
            None => JobState::Unknown,
        })
    }

    /// Poll every `interval` until an artifact appears.
    ///
    /// Gives up with [`ScriptError::StuckJob`] once `timeout` has elapsed;
    /// that only means no result was seen, not that the job failed.
    pub async fn wait_for_outcome(
        &self,
        server_node_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<JobOutcome, ScriptError> {
        let start = Instant::now();
        loop {
            if let Some(outcome) = self.poll(server_node_id).await? {
                return Ok(outcome);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                tracing::warn!(
                    server_node_id,
                    waited_ms = elapsed.as_millis() as u64,
                    "No status artifact before timeout"
                );
                return Err(ScriptError::StuckJob {
                    server_node_id: server_node_id.to_string(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            tokio::time::sleep(interval.min(timeout - elapsed)).await;
        }
    }

    /// Delete a consumed artifact. Returns whether one existed.
    pub async fn acknowledge(&self, server_node_id: &str) -> Result<bool, ScriptError> {
        remove_if_exists(&self.status_path(server_node_id)).await
    }
}

/// Visible `.json` entries of `dir`; temporary files are skipped.
async fn list_descriptors(dir: &Path) -> Result<Vec<String>, ScriptError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ScriptError::Io(e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') && name.ends_with(".json") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

async fn remove_if_exists(path: &Path) -> Result<bool, ScriptError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ScriptError::Io(e)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::scripting::test_helpers::job;
    use crate::scripting::ScriptCommand;

    fn queue() -> (tempfile::TempDir, ScriptJobQueue) {
        let dir = tempfile::tempdir().expect("temp dir");
        let q = ScriptJobQueue::new(dir.path());
        (dir, q)
    }

    #[tokio::test]
    async fn submit_lands_in_new() {
        let (_dir, q) = queue();
        let path = q
            .submit(&job("n1", ScriptCommand::Bootstrap))
            .await
            .expect("submit");
        assert!(path.starts_with(q.new_dir()));
        assert_eq!(q.pending().await.expect("pending"), vec!["bootstrap-n1.json"]);
        assert!(q.executing().await.expect("executing").is_empty());
    }

    #[tokio::test]
    async fn claimed_job_leaves_new() {
        let (_dir, q) = queue();
        let submitted = job("n1", ScriptCommand::Install);
        q.submit(&submitted).await.expect("submit");

        let claimed = q
            .claim("install-n1.json")
            .await
            .expect("claim")
            .expect("won claim");
        assert_eq!(claimed.descriptor, submitted);
        assert!(q.pending().await.expect("pending").is_empty());
        assert_eq!(
            q.executing().await.expect("executing"),
            vec!["install-n1.json"]
        );
        assert_eq!(
            q.job_state(&submitted).await.expect("state"),
            JobState::Executing
        );
    }

    #[tokio::test]
    async fn concurrent_claims_have_exactly_one_winner() {
        let (_dir, q) = queue();
        q.submit(&job("n1", ScriptCommand::Bootstrap))
            .await
            .expect("submit");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.claim("bootstrap-n1.json").await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join").expect("claim").is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn duplicate_submission_conflicts_while_pending_or_executing() {
        let (_dir, q) = queue();
        let j = job("n1", ScriptCommand::Install);
        q.submit(&j).await.expect("submit");
        assert_matches!(
            q.submit(&j).await,
            Err(ScriptError::JobSubmissionConflict { .. })
        );

        let claimed = q.claim_next().await.expect("claim").expect("job");
        assert_matches!(
            q.submit(&j).await,
            Err(ScriptError::JobSubmissionConflict { .. })
        );

        q.complete(&claimed, &StatusArtifact::success())
            .await
            .expect("complete");
        q.submit(&j).await.expect("resubmit after completion");
    }

    #[tokio::test]
    async fn other_command_for_busy_node_conflicts() {
        let (_dir, q) = queue();
        q.submit(&job("n1", ScriptCommand::Install))
            .await
            .expect("submit install");
        let install = q.claim_next().await.expect("claim").expect("job");

        assert_matches!(
            q.submit(&job("n1", ScriptCommand::Uninstall)).await,
            Err(ScriptError::JobSubmissionConflict {
                command: ScriptCommand::Install,
                ..
            })
        );
        assert!(q.pending().await.expect("pending").is_empty());

        q.complete(&install, &StatusArtifact::failure(3, "install broke"))
            .await
            .expect("complete");
        assert_matches!(
            q.poll("n1").await.expect("poll"),
            Some(JobOutcome::Failed(_))
        );

        // Once install has reported, uninstall starts from a clean slate.
        q.submit(&job("n1", ScriptCommand::Uninstall))
            .await
            .expect("submit uninstall");
        assert_eq!(q.poll("n1").await.expect("poll"), None);
        assert_eq!(
            q.pending().await.expect("pending"),
            vec!["uninstall-n1.json".to_string()]
        );

        // Other nodes are unaffected.
        q.submit(&job("n2", ScriptCommand::Install))
            .await
            .expect("submit other node");
    }

    #[tokio::test]
    async fn success_round_trip() {
        let (_dir, q) = queue();
        let j = job("n1", ScriptCommand::Bootstrap);
        q.submit(&j).await.expect("submit");
        assert_eq!(q.poll("n1").await.expect("poll"), None);

        let claimed = q.claim_next().await.expect("claim").expect("job");
        q.complete(&claimed, &StatusArtifact::success())
            .await
            .expect("complete");

        assert_eq!(q.poll("n1").await.expect("poll"), Some(JobOutcome::Succeeded));
        assert!(q.executing().await.expect("executing").is_empty());
        assert_eq!(
            q.job_state(&j).await.expect("state"),
            JobState::Completed(JobOutcome::Succeeded)
        );
    }

    #[tokio::test]
    async fn failure_round_trip_carries_exact_message() {
        let (_dir, q) = queue();
        q.submit(&job("n1_n2", ScriptCommand::Install))
            .await
            .expect("submit");
        let claimed = q.claim_next().await.expect("claim").expect("job");
        q.complete(
            &claimed,
            &StatusArtifact::failure(3, "install.sh: recipe not found"),
        )
        .await
        .expect("complete");

        assert!(q.status_path("n1_n2").ends_with("output-nodeid-n1_n2_status.json"));
        let failure = q
            .poll("n1_n2")
            .await
            .expect("poll")
            .expect("artifact")
            .into_result()
            .unwrap_err();
        assert_eq!(failure.exit_status, 3);
        assert_eq!(failure.message.as_deref(), Some("install.sh: recipe not found"));
    }

    #[tokio::test]
    async fn submit_clears_stale_artifact_for_node() {
        let (_dir, q) = queue();
        q.init().await.expect("init");
        status::write_status(q.scripts_dir(), "n1", &StatusArtifact::failure(1, "old"))
            .await
            .expect("stale artifact");

        q.submit(&job("n1", ScriptCommand::Bootstrap))
            .await
            .expect("submit");
        assert_eq!(q.poll("n1").await.expect("poll"), None);
    }

    #[tokio::test]
    async fn wait_for_outcome_reports_stuck_job() {
        let (_dir, q) = queue();
        q.submit(&job("n1", ScriptCommand::Bootstrap))
            .await
            .expect("submit");
        q.claim_next().await.expect("claim").expect("job");

        let err = q
            .wait_for_outcome("n1", Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_matches!(err, ScriptError::StuckJob { ref server_node_id, .. } if server_node_id == "n1");
    }

    #[tokio::test]
    async fn wait_for_outcome_returns_once_reported() {
        let (_dir, q) = queue();
        q.submit(&job("n1", ScriptCommand::Bootstrap))
            .await
            .expect("submit");
        let claimed = q.claim_next().await.expect("claim").expect("job");

        let writer = {
            let q = q.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                q.complete(&claimed, &StatusArtifact::success()).await
            })
        };

        let outcome = q
            .wait_for_outcome("n1", Duration::from_secs(5), Duration::from_millis(10))
            .await
            .expect("outcome");
        assert!(outcome.is_success());
        writer.await.expect("join").expect("complete");
    }

    #[tokio::test]
    async fn acknowledge_removes_artifact() {
        let (_dir, q) = queue();
        q.init().await.expect("init");
        status::write_status(q.scripts_dir(), "n1", &StatusArtifact::success())
            .await
            .expect("artifact");
        assert!(q.acknowledge("n1").await.expect("ack"));
        assert!(!q.acknowledge("n1").await.expect("ack again"));
    }

    #[tokio::test]
    async fn temporary_files_are_not_listed() {
        let (_dir, q) = queue();
        q.init().await.expect("init");
        tokio::fs::write(q.new_dir().join(".install-n1.json.abc.tmp"), b"{}")
            .await
            .expect("write tmp");
        tokio::fs::write(q.new_dir().join("notes.txt"), b"")
            .await
            .expect("write other");
        assert!(q.pending().await.expect("pending").is_empty());
        assert!(q.claim_next().await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn invalid_descriptor_is_rejected_on_submit() {
        let (_dir, q) = queue();
        let bad = JobDescriptor::new("a/b", ScriptCommand::Install, "sh");
        assert_matches!(q.submit(&bad).await, Err(ScriptError::InvalidDescriptor(_)));
    }

    #[tokio::test]
    async fn unreadable_claimed_descriptor_is_reported() {
        let (_dir, q) = queue();
        q.init().await.expect("init");
        tokio::fs::write(q.new_dir().join("install-n1.json"), b"garbage")
            .await
            .expect("write");
        assert_matches!(
            q.claim("install-n1.json").await,
            Err(ScriptError::InvalidDescriptor(_))
        );
    }
}
