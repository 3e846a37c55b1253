/// Runner Contract - Backend-independent job lifecycle operations
///
/// **Core Responsibility:**
/// Start, observe, cancel and clean up jobs keyed by (project_id, trajectory_id).
///
/// **Failure Surface:**
/// - Only `start_job` returns errors, and only for provisioning failures
/// - Every other operation logs engine trouble and answers with an absent,
///   empty or negative result
///
/// Implementations decide where jobs run. Callers (CLI, reaper, schedulers)
/// hold an `Arc<dyn Runner>` and never see the backend.
use crate::error::Result;
use crate::job::JobFunction;
use async_trait::async_trait;
use dockyard_common::types::{JobDetails, JobInfo, JobStatus, JobsStatusSummary, RunnerInfo};
use std::collections::BTreeMap;

/// Everything needed to start one job
#[derive(Debug, Clone)]
pub struct StartJobRequest {
    pub project_id: String,
    pub trajectory_id: String,
    pub job_func: JobFunction,
    pub node_id: Option<u64>,
    /// Per-call image, beats every configured source
    pub image: Option<String>,
    pub memory_limit: Option<String>,
    pub memory_swap_limit: Option<String>,
    /// Forwarded to the job as `OTEL_{key}`
    pub trace_context: BTreeMap<String, String>,
}

impl StartJobRequest {
    pub fn new(project_id: &str, trajectory_id: &str, job_func: JobFunction) -> Self {
        Self {
            project_id: project_id.to_string(),
            trajectory_id: trajectory_id.to_string(),
            job_func,
            node_id: None,
            image: None,
            memory_limit: None,
            memory_swap_limit: None,
            trace_context: BTreeMap::new(),
        }
    }

    pub fn with_node(mut self, node_id: u64) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

#[async_trait]
pub trait Runner: Send + Sync {
    /// Start a job unless one with the same key is already active
    ///
    /// `Ok(true)` when a new job was launched, `Ok(false)` when an active
    /// job already exists or the engine refused the launch.
    async fn start_job(&self, request: StartJobRequest) -> Result<bool>;

    /// All managed jobs, optionally restricted to one project
    async fn get_jobs(&self, project_id: Option<&str>) -> Vec<JobInfo>;

    async fn get_job_status(&self, project_id: &str, trajectory_id: &str) -> Option<JobStatus>;

    async fn job_exists(&self, project_id: &str, trajectory_id: &str) -> bool {
        self.get_job_status(project_id, trajectory_id).await.is_some()
    }

    /// Cancel one job, or every job of the project when `trajectory_id` is None
    async fn cancel_job(&self, project_id: &str, trajectory_id: Option<&str>);

    /// Remove the job's resources; true once they are gone
    async fn cleanup_job(&self, project_id: &str, trajectory_id: &str) -> bool;

    async fn get_job_logs(&self, project_id: &str, trajectory_id: &str) -> Option<String>;

    async fn get_job_details(&self, project_id: &str, trajectory_id: &str) -> Option<JobDetails>;

    async fn get_runner_info(&self) -> RunnerInfo;

    async fn get_jobs_summary(&self, project_id: Option<&str>) -> JobsStatusSummary {
        let jobs = self.get_jobs(project_id).await;
        JobsStatusSummary::from_jobs(project_id, &jobs)
    }
}
