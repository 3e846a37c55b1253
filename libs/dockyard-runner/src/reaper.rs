/// Reaper - External TTL and timeout policy
///
/// The runner only exposes mechanism (`get_jobs`, `cleanup_job`). Deciding
/// when a job is old enough to remove lives here, so any backend gets the
/// same policy and the runner never acts on its own.
///
/// - Terminal jobs are removed once `ended_at` is older than the TTL
/// - Active jobs are removed once they ran (or waited) longer than the timeout
use crate::runner::Runner;
use chrono::{DateTime, Utc};
use dockyard_common::config::RunnerConfig;
use dockyard_common::types::JobInfo;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    pub job_ttl: Duration,
    pub timeout: Duration,
}

impl ReapPolicy {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            job_ttl: Duration::from_secs(config.job_ttl_seconds),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    Expired,
    TimedOut,
}

/// Job ids touched by one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub expired: Vec<String>,
    pub timed_out: Vec<String>,
    pub failed: Vec<String>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.timed_out.is_empty() && self.failed.is_empty()
    }
}

fn older_than(since: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    // Negative ages (clock skew) never qualify
    (now - since).to_std().map_or(false, |age| age > limit)
}

/// Whether `job` should be removed at `now`
pub fn reap_reason(job: &JobInfo, policy: &ReapPolicy, now: DateTime<Utc>) -> Option<ReapReason> {
    if job.status.is_terminal() {
        let ended_at = job.ended_at?;
        return older_than(ended_at, now, policy.job_ttl).then_some(ReapReason::Expired);
    }
    if job.status.is_active() {
        let since = job.started_at.unwrap_or(job.enqueued_at);
        return older_than(since, now, policy.timeout).then_some(ReapReason::TimedOut);
    }
    None
}

pub struct Reaper {
    runner: Arc<dyn Runner>,
    policy: ReapPolicy,
}

impl Reaper {
    pub fn new(runner: Arc<dyn Runner>, policy: ReapPolicy) -> Self {
        Self { runner, policy }
    }

    pub fn policy(&self) -> &ReapPolicy {
        &self.policy
    }

    pub async fn reap_once(&self, project_id: Option<&str>) -> ReapReport {
        self.reap_at(project_id, Utc::now()).await
    }

    pub async fn reap_at(&self, project_id: Option<&str>, now: DateTime<Utc>) -> ReapReport {
        let mut report = ReapReport::default();

        for job in self.runner.get_jobs(project_id).await {
            let Some(reason) = reap_reason(&job, &self.policy, now) else {
                continue;
            };

            debug!(job_id = %job.id, status = %job.status, ?reason, "reaping job");
            if !self.runner.cleanup_job(&job.project_id, &job.trajectory_id).await {
                warn!(job_id = %job.id, "failed to clean up job");
                report.failed.push(job.id);
                continue;
            }

            match reason {
                ReapReason::Expired => report.expired.push(job.id),
                ReapReason::TimedOut => {
                    warn!(job_id = %job.id, timeout_secs = self.policy.timeout.as_secs(), "job exceeded timeout");
                    report.timed_out.push(job.id)
                }
            }
        }

        report
    }

    /// Reap every `interval` until `shutdown` resolves
    pub async fn run_until<F>(&self, project_id: Option<&str>, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            interval_secs = interval.as_secs(),
            ttl_secs = self.policy.job_ttl.as_secs(),
            timeout_secs = self.policy.timeout.as_secs(),
            "reaper started"
        );

        let mut ticker = tokio::time::interval(interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.reap_once(project_id).await;
                    if !report.is_empty() {
                        info!(
                            expired = report.expired.len(),
                            timed_out = report.timed_out.len(),
                            failed = report.failed.len(),
                            "reap pass complete"
                        );
                    }
                }
            }
        }
    }
}
