// CLI commands for driving the docker runner
use anyhow::{bail, Context, Result};
use dockyard_common::config::RunnerConfig;
use dockyard_common::identity::job_id;
use dockyard_common::types::{JobStatus, RunnerStatus};
use dockyard_runner::{
    DockerCli, DockerRunner, JobFunction, JsonInstanceResolver, ReapPolicy, ReapReport, Reaper,
    Runner, StartJobRequest,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

/// Runner wired to the docker CLI and on-disk instance metadata
pub fn build_runner(instances_dir: &Path) -> Arc<DockerRunner> {
    let config = RunnerConfig::from_env();
    let engine = Arc::new(DockerCli::new(config.docker_binary.clone()));
    let resolver = Arc::new(JsonInstanceResolver::new(instances_dir));
    Arc::new(DockerRunner::new(config, engine, resolver))
}

#[allow(clippy::too_many_arguments)]
pub async fn start_job(
    runner: &DockerRunner,
    project: &str,
    trajectory: &str,
    func: &str,
    node: Option<u64>,
    image: Option<String>,
    memory: Option<String>,
    memory_swap: Option<String>,
) -> Result<()> {
    let job_func = JobFunction::parse(func)
        .with_context(|| format!("Invalid job function '{}'", func))?;

    let mut request = StartJobRequest::new(project, trajectory, job_func);
    request.node_id = node;
    request.image = image;
    request.memory_limit = memory;
    request.memory_swap_limit = memory_swap;

    let started = runner
        .start_job(request)
        .await
        .with_context(|| format!("Failed to start job {}", job_id(project, trajectory)))?;

    if started {
        println!("🚀 Started job {}", job_id(project, trajectory));
        println!("   Container: {}", runner.resource_name(project, trajectory));
    } else {
        println!(
            "⚠️  Job {} was not started (already active or rejected by the engine)",
            job_id(project, trajectory)
        );
    }
    Ok(())
}

pub async fn show_status(runner: &DockerRunner, project: &str, trajectory: &str) -> Result<()> {
    match runner.get_job_status(project, trajectory).await {
        Some(status) => println!("{}", status),
        None => bail!("Job {} not found", job_id(project, trajectory)),
    }
    Ok(())
}

pub async fn list_jobs(runner: &DockerRunner, project: Option<&str>) -> Result<()> {
    let mut jobs = runner.get_jobs(project).await;
    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }
    jobs.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));

    println!("📋 Jobs:");
    println!();
    for job in jobs {
        let marker = match job.status {
            JobStatus::Running => "▶",
            JobStatus::Pending => "…",
            JobStatus::Completed => "✓",
            JobStatus::Failed => "✗",
            JobStatus::Canceled | JobStatus::Stopped => "■",
        };
        println!("  {} {} ({})", marker, job.id, job.status);
        println!("      Enqueued: {}", job.enqueued_at.to_rfc3339());
        if let Some(started_at) = job.started_at {
            println!("      Started:  {}", started_at.to_rfc3339());
        }
        if let Some(ended_at) = job.ended_at {
            println!("      Ended:    {}", ended_at.to_rfc3339());
        }
    }
    Ok(())
}

pub async fn show_summary(runner: &DockerRunner, project: Option<&str>) -> Result<()> {
    let summary = runner.get_jobs_summary(project).await;

    println!("📊 Jobs: {}", summary.total);
    for status in JobStatus::all_variants() {
        let count = summary.count(*status);
        if count > 0 {
            println!("   {:<10} {}", status.as_str(), count);
        }
    }
    Ok(())
}

pub async fn cancel_jobs(runner: &DockerRunner, project: &str, trajectory: Option<&str>) -> Result<()> {
    runner.cancel_job(project, trajectory).await;
    match trajectory {
        Some(trajectory) => println!("✓ Canceled job {}", job_id(project, trajectory)),
        None => println!("✓ Canceled all jobs in project {}", project),
    }
    Ok(())
}

pub async fn cleanup_job(runner: &DockerRunner, project: &str, trajectory: &str) -> Result<()> {
    if !runner.cleanup_job(project, trajectory).await {
        bail!("Failed to clean up job {}", job_id(project, trajectory));
    }
    println!("✓ Cleaned up job {}", job_id(project, trajectory));
    Ok(())
}

pub async fn show_logs(runner: &DockerRunner, project: &str, trajectory: &str) -> Result<()> {
    match runner.get_job_logs(project, trajectory).await {
        Some(logs) => print!("{}", logs),
        None => println!("No logs available for {}", job_id(project, trajectory)),
    }
    Ok(())
}

pub async fn show_details(runner: &DockerRunner, project: &str, trajectory: &str) -> Result<()> {
    let details = match runner.get_job_details(project, trajectory).await {
        Some(details) => details,
        None => bail!("Job {} not found", job_id(project, trajectory)),
    };
    let json = serde_json::to_string_pretty(&details).context("Failed to serialize job details")?;
    println!("{}", json);
    Ok(())
}

pub async fn show_info(runner: &DockerRunner) -> Result<()> {
    let info = runner.get_runner_info().await;
    let json = serde_json::to_string_pretty(&info).context("Failed to serialize runner info")?;
    println!("{}", json);
    if info.status == RunnerStatus::Error {
        bail!("Container engine is unavailable");
    }
    Ok(())
}

fn print_report(report: &ReapReport) {
    println!(
        "🧹 Reaped {} expired, {} timed out ({} failed)",
        report.expired.len(),
        report.timed_out.len(),
        report.failed.len()
    );
    for id in &report.failed {
        println!("   ✗ {}", id);
    }
}

pub async fn reap(
    runner: Arc<DockerRunner>,
    project: Option<&str>,
    once: bool,
    interval_secs: u64,
) -> Result<()> {
    if interval_secs == 0 {
        bail!("--interval-secs must be greater than zero");
    }

    let policy = ReapPolicy::from_config(runner.config());
    let reaper = Reaper::new(runner, policy);

    if once {
        let report = reaper.reap_once(project).await;
        print_report(&report);
        return Ok(());
    }

    // Setup graceful shutdown
    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("received shutdown signal"),
            Err(e) => {
                error!(error = %e, "failed to install CTRL+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    reaper
        .run_until(project, Duration::from_secs(interval_secs), shutdown)
        .await;
    println!("✓ Reaper shutdown complete");
    Ok(())
}
