//! Persisted deployment job records.
//!
//! A deploy request returns before any file is copied. The job record is
//! how callers learn whether the background work is still queued, running,
//! finished, or failed, and which step failed.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use corehost_core::{JobId, StorageBackend, VersionId, WritePrecondition};

use crate::error::{ReleaseError, Result};
use crate::paths;

/// Names of the four deployment steps, in execution order.
pub const DEPLOY_STEPS: [&str; 4] = [
    "Pulling core files from upstream",
    "Creating version folder",
    "Computing content manifest",
    "Updating version registry",
];

/// Error recorded on jobs that were in flight when the process stopped.
pub const INTERRUPTED: &str = "interrupted by restart";

/// Deployment job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Persisted, worker not yet started.
    Queued,
    /// Worker is executing steps.
    Running,
    /// Every step completed and the registry was updated.
    Succeeded,
    /// A step failed; see the job's `error`.
    Failed,
}

impl JobState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match (self, target) {
            (Self::Queued, Self::Running | Self::Failed) => true,
            (Self::Running, Self::Succeeded | Self::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Progress of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started.
    Pending,
    /// Executing.
    InProgress,
    /// Done.
    Completed,
    /// Aborted the deployment.
    Failed,
}

/// One entry of the four-step progress plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployStep {
    /// 1-based position.
    pub step: u8,
    /// Human-readable name.
    pub name: String,
    /// Progress.
    pub status: StepStatus,
}

/// A deployment of one version, from request to terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentJob {
    /// Job identifier.
    pub id: JobId,
    /// Version being deployed, spelled as requested.
    pub version: VersionId,
    /// Release notes for the new entry.
    pub description: String,
    /// Current state.
    pub state: JobState,
    /// Step progress.
    pub steps: Vec<DeployStep>,
    /// Failure message, set when `state` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the job was accepted.
    pub created_at: DateTime<Utc>,
    /// When the worker started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentJob {
    /// Creates a queued job with every step pending.
    #[must_use]
    pub fn new(version: VersionId, description: impl Into<String>) -> Self {
        let steps = DEPLOY_STEPS
            .iter()
            .zip(1u8..)
            .map(|(name, step)| DeployStep {
                step,
                name: (*name).to_string(),
                status: StepStatus::Pending,
            })
            .collect();
        Self {
            id: JobId::generate(),
            version,
            description: description.into(),
            state: JobState::Queued,
            steps,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Moves the job to `running`.
    pub fn start(&mut self) {
        if self.state.can_transition_to(JobState::Running) {
            self.state = JobState::Running;
            self.started_at = Some(Utc::now());
        }
    }

    /// Marks step `index` (0-based) in progress.
    pub fn begin_step(&mut self, index: usize) {
        self.set_step(index, StepStatus::InProgress);
    }

    /// Marks step `index` (0-based) completed.
    pub fn complete_step(&mut self, index: usize) {
        self.set_step(index, StepStatus::Completed);
    }

    /// Moves the job to `failed`, failing whichever step was in progress.
    pub fn fail(&mut self, error: impl Into<String>) {
        if !self.state.can_transition_to(JobState::Failed) {
            return;
        }
        for step in &mut self.steps {
            if step.status == StepStatus::InProgress {
                step.status = StepStatus::Failed;
            }
        }
        self.state = JobState::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    /// Moves the job to `succeeded`.
    pub fn succeed(&mut self) {
        if self.state.can_transition_to(JobState::Succeeded) {
            self.state = JobState::Succeeded;
            self.finished_at = Some(Utc::now());
        }
    }

    /// The step that failed, if any.
    #[must_use]
    pub fn failed_step(&self) -> Option<&DeployStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    fn set_step(&mut self, index: usize, status: StepStatus) {
        if let Some(step) = self.steps.get_mut(index) {
            step.status = status;
        }
    }
}

/// Storage-backed job records.
#[derive(Clone)]
pub struct JobStore {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore").finish_non_exhaustive()
    }
}

impl JobStore {
    /// Creates a job store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Writes the job record. Only the deploy worker holding the deploy
    /// lock writes a given job, so writes are unconditional.
    ///
    /// # Errors
    ///
    /// Returns a storage or encode error.
    pub async fn save(&self, job: &DeploymentJob) -> Result<()> {
        let bytes = Bytes::from(serde_json::to_vec(job)?);
        self.storage
            .put(&paths::job(&job.id), bytes, WritePrecondition::None)
            .await?;
        Ok(())
    }

    /// Fetches one job.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseError::NotFound`] if no such job exists.
    pub async fn get(&self, id: &JobId) -> Result<DeploymentJob> {
        match self.storage.get(&paths::job(id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.is_not_found() => Err(ReleaseError::not_found("deployment job", id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists every job, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage or decode error.
    pub async fn list(&self) -> Result<Vec<DeploymentJob>> {
        let metas = self.storage.list(paths::JOBS_PREFIX).await?;
        let mut jobs = Vec::with_capacity(metas.len());
        for meta in metas {
            match self.storage.get(&meta.path).await {
                Ok(bytes) => jobs.push(serde_json::from_slice::<DeploymentJob>(&bytes)?),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(jobs)
    }

    /// Fails every job still `queued` or `running`. Called once at startup,
    /// before any new deploy is accepted.
    ///
    /// Returns the jobs that were failed.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error.
    pub async fn fail_interrupted(&self) -> Result<Vec<DeploymentJob>> {
        let mut failed = Vec::new();
        for mut job in self.list().await? {
            if job.state.is_terminal() {
                continue;
            }
            job.fail(INTERRUPTED);
            self.save(&job).await?;
            tracing::warn!(job_id = %job.id, version = %job.version, "marked interrupted deployment as failed");
            failed.push(job);
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corehost_core::MemoryBackend;

    fn v(s: &str) -> VersionId {
        s.parse().unwrap()
    }

    #[test]
    fn new_job_has_four_pending_steps() {
        let job = DeploymentJob::new(v("1.2.0"), "bugfixes");
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.steps.len(), 4);
        assert_eq!(job.steps[0].step, 1);
        assert_eq!(job.steps[3].name, "Updating version registry");
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn failure_marks_the_running_step() {
        let mut job = DeploymentJob::new(v("1.2.0"), "");
        job.start();
        job.begin_step(0);
        job.complete_step(0);
        job.begin_step(1);
        job.fail("disk full");

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("disk full"));
        assert_eq!(job.failed_step().map(|s| s.step), Some(2));
        assert_eq!(job.steps[0].status, StepStatus::Completed);
        assert_eq!(job.steps[2].status, StepStatus::Pending);
        assert!(job.finished_at.is_some());

        // Terminal jobs stay put.
        job.succeed();
        assert_eq!(job.state, JobState::Failed);
    }

    #[test]
    fn state_machine() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Failed));
        assert!(!JobState::Queued.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Failed));
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn serializes_camel_case() {
        let job = DeploymentJob::new(v("v2.0.0"), "major");
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["state"], "queued");
        assert_eq!(json["version"], "v2.0.0");
        assert_eq!(json["steps"][0]["status"], "pending");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn store_round_trip_and_interrupt_recovery() {
        let store = JobStore::new(Arc::new(MemoryBackend::new()));

        let mut done = DeploymentJob::new(v("1.0.1"), "");
        done.start();
        done.succeed();
        store.save(&done).await.unwrap();

        let mut running = DeploymentJob::new(v("1.0.2"), "");
        running.start();
        running.begin_step(0);
        store.save(&running).await.unwrap();

        let queued = DeploymentJob::new(v("1.0.3"), "");
        store.save(&queued).await.unwrap();

        assert_eq!(store.get(&running.id).await.unwrap(), running);
        assert_eq!(store.list().await.unwrap().len(), 3);

        let failed = store.fail_interrupted().await.unwrap();
        assert_eq!(failed.len(), 2);

        let running = store.get(&running.id).await.unwrap();
        assert_eq!(running.state, JobState::Failed);
        assert_eq!(running.error.as_deref(), Some(INTERRUPTED));
        assert_eq!(store.get(&done.id).await.unwrap().state, JobState::Succeeded);
        assert_eq!(store.get(&queued.id).await.unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let store = JobStore::new(Arc::new(MemoryBackend::new()));
        let err = store.get(&JobId::generate()).await.unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound { .. }));
    }
}
