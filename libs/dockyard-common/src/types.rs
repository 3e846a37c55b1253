use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Canonical job lifecycle state
/// Backend-independent - every runner maps its raw state onto this enum
///
/// ## Transitions (per resource instance)
/// - Pending → Running → Completed | Failed
/// - Stopped only arises from explicit cancellation actions
/// - Canceled is assigned by the runner layer, never read from raw engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
    Stopped,
}

impl JobStatus {
    /// Returns all status variants in lifecycle order
    pub fn all_variants() -> &'static [JobStatus] {
        &[
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Canceled,
            JobStatus::Stopped,
        ]
    }

    /// Terminal states carry an `ended_at` timestamp
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Non-terminal states; at most one such resource may exist per job key
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of one job
///
/// `id` is always `project_id:trajectory_id` built from the raw,
/// un-sanitized identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub project_id: String,
    pub trajectory_id: String,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff `status.is_terminal()`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// One named block of a diagnostic report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetailSection {
    pub name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Value>>,
}

impl JobDetailSection {
    pub fn with_data(name: &str, display_name: &str, data: Map<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            data: Some(data),
            items: None,
        }
    }

    pub fn with_items(name: &str, display_name: &str, items: Vec<Value>) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            data: None,
            items: Some(items),
        }
    }
}

/// Structured diagnostic report for a job
/// Built on demand from backend inspection data, never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetails {
    pub id: String,
    pub project_id: String,
    pub trajectory_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub sections: Vec<JobDetailSection>,
    pub raw_data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobDetails {
    pub fn section(&self, name: &str) -> Option<&JobDetailSection> {
        self.sections.iter().find(|s| s.name == name)
    }
}

/// Backend health as seen by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerInfo {
    pub runner_type: String,
    pub status: RunnerStatus,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl RunnerInfo {
    pub fn running(runner_type: &str, data: Map<String, Value>) -> Self {
        Self {
            runner_type: runner_type.to_string(),
            status: RunnerStatus::Running,
            data,
        }
    }

    pub fn error(runner_type: &str, message: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(message.into()));
        Self {
            runner_type: runner_type.to_string(),
            status: RunnerStatus::Error,
            data,
        }
    }
}

/// Per-status job counts over one listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobsStatusSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub total: usize,
    pub counts: BTreeMap<JobStatus, usize>,
}

impl JobsStatusSummary {
    pub fn from_jobs(project_id: Option<&str>, jobs: &[JobInfo]) -> Self {
        let mut counts = BTreeMap::new();
        for job in jobs {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Self {
            project_id: project_id.map(str::to_string),
            total: jobs.len(),
            counts,
        }
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}
