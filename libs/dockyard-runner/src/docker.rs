/// Docker Runner - Job lifecycle on a local container engine
///
/// **Core Responsibility:**
/// One container per (project_id, trajectory_id), named deterministically and
/// labeled so that every listing, cancel and cleanup can find it again.
///
/// **Lifecycle:**
/// - start: lock → inspect → replace stale/finished → provision → `run -d`
/// - observe: `ps` for listing, `inspect` for state, `logs` for output
/// - teardown: `stop` then `rm -f`; "already gone" counts as success
///
/// **What the runner does NOT do:**
/// - Enforce TTL or timeout (see `reaper`)
/// - Write job status (the engine's own state machine owns it)
/// - Retry failed engine commands
use crate::details::{build_job_details, DetailsInput};
use crate::engine::{ContainerEngine, EngineOutput};
use crate::error::{EngineError, Result};
use crate::instance::InstanceResolver;
use crate::lock::{NoopStartLock, StartLock};
use crate::provision::{resolve_image, EnvSource, LaunchPlan, ProcessEnv, ProvisionInput};
use crate::runner::{Runner, StartJobRequest};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use dockyard_common::config::RunnerConfig;
use dockyard_common::identity::{
    job_id, managed_filter, project_filter, resource_name, sanitize_label,
};
use dockyard_common::status::{
    map_container_state, parse_engine_timestamp, RawContainerState, STATE_INSPECT_FORMAT,
};
use dockyard_common::types::{JobDetails, JobInfo, JobStatus, RunnerInfo};
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const RUNNER_TYPE: &str = "docker";

/// Separator between `ps` format fields; never appears in names or labels
pub const FIELD_SEPARATOR: char = '\x1f';

/// name, sanitized project/trajectory, raw project/trajectory, state, created
pub const LIST_FORMAT: &str = "{{.Names}}\x1f{{.Label \"project_id\"}}\x1f{{.Label \"trajectory_id\"}}\x1f{{.Label \"dockyard.project_id\"}}\x1f{{.Label \"dockyard.trajectory_id\"}}\x1f{{.State}}\x1f{{.CreatedAt}}";

/// container id, raw project
pub const CANCEL_FORMAT: &str = "{{.ID}}\x1f{{.Label \"dockyard.project_id\"}}";

const SERVER_VERSION_FORMAT: &str = "{{.ServerVersion}}";

/// Upper bound on concurrent `inspect` processes while listing
pub const INSPECT_CONCURRENCY: usize = 8;

/// What an `inspect` of one resource name revealed
#[derive(Debug, Clone, PartialEq)]
enum Presence {
    Missing,
    Found(RawContainerState),
    /// Exists, but the state could not be parsed
    Stale(String),
    /// The engine ran but could not answer
    Unavailable,
}

/// One row of the managed-resource listing
#[derive(Debug, Clone, PartialEq)]
struct ListedResource {
    name: String,
    project_id: String,
    trajectory_id: String,
    /// Ids came from the raw labels rather than the sanitized fallback
    raw_ids: bool,
    created_at: Option<DateTime<Utc>>,
}

impl ListedResource {
    fn belongs_to(&self, project_id: &str) -> bool {
        if self.raw_ids {
            self.project_id == project_id
        } else {
            self.project_id == sanitize_label(project_id)
        }
    }
}

pub struct DockerRunner {
    config: RunnerConfig,
    engine: Arc<dyn ContainerEngine>,
    resolver: Arc<dyn InstanceResolver>,
    start_lock: Arc<dyn StartLock>,
    env_source: Arc<dyn EnvSource>,
}

impl DockerRunner {
    pub fn new(
        config: RunnerConfig,
        engine: Arc<dyn ContainerEngine>,
        resolver: Arc<dyn InstanceResolver>,
    ) -> Self {
        let platform = config
            .platform_override()
            .unwrap_or_else(|| "native".to_string());
        info!(
            network = %config.network_name,
            architecture = %config.architecture,
            host_architecture = %config.host_architecture,
            platform = %platform,
            image_prefix = %config.image_prefix,
            source_mounted = config.source_dir.is_some(),
            update_on_start = config.update_on_start,
            memory_limit = config.memory_limit.as_deref().unwrap_or("unlimited"),
            "docker runner initialized"
        );

        Self {
            config,
            engine,
            resolver,
            start_lock: Arc::new(NoopStartLock),
            env_source: Arc::new(ProcessEnv),
        }
    }

    pub fn with_start_lock(mut self, start_lock: Arc<dyn StartLock>) -> Self {
        self.start_lock = start_lock;
        self
    }

    pub fn with_env_source(mut self, env_source: Arc<dyn EnvSource>) -> Self {
        self.env_source = env_source;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn resource_name(&self, project_id: &str, trajectory_id: &str) -> String {
        resource_name(&self.config.name_prefix, project_id, trajectory_id)
    }

    async fn exec(&self, args: &[&str]) -> std::result::Result<EngineOutput, EngineError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.engine.run(&args).await
    }

    /// Inspect one resource; `Err` only when the engine could not be invoked
    async fn inspect_state(&self, name: &str) -> std::result::Result<Presence, EngineError> {
        let output = self
            .exec(&["inspect", "--format", STATE_INSPECT_FORMAT, name])
            .await?;

        if output.is_not_found() {
            return Ok(Presence::Missing);
        }
        if !output.success() {
            warn!(container = name, stderr = %output.stderr.trim(), "inspect failed");
            return Ok(Presence::Unavailable);
        }

        Ok(match RawContainerState::parse_inspect_line(output.stdout.trim()) {
            Some(raw) => Presence::Found(raw),
            None => Presence::Stale(output.stdout.trim().to_string()),
        })
    }

    /// `inspect_state` for read-only callers, where an unreachable engine means "absent"
    async fn observe(&self, name: &str) -> Presence {
        match self.inspect_state(name).await {
            Ok(presence) => presence,
            Err(e) => {
                error!(container = name, error = %e, "failed to inspect container");
                Presence::Unavailable
            }
        }
    }

    /// Stop then force-remove one container
    async fn remove_container(&self, name: &str) -> bool {
        match self.exec(&["stop", name]).await {
            Ok(output) if output.is_not_found() => {
                debug!(container = name, "container already gone");
                return true;
            }
            Ok(output) if !output.success() => {
                warn!(container = name, stderr = %output.stderr.trim(), "stop failed, forcing removal");
            }
            Ok(_) => {}
            Err(e) => {
                error!(container = name, error = %e, "failed to stop container");
                return false;
            }
        }

        match self.exec(&["rm", "-f", name]).await {
            Ok(output) if output.success() || output.is_not_found() => {
                info!(container = name, "container removed");
                true
            }
            Ok(output) => {
                error!(container = name, stderr = %output.stderr.trim(), "failed to remove container");
                false
            }
            Err(e) => {
                error!(container = name, error = %e, "failed to remove container");
                false
            }
        }
    }

    async fn container_logs(&self, name: &str) -> Option<String> {
        match self.exec(&["logs", name]).await {
            Ok(output) if output.success() => {
                let logs = output.combined();
                if logs.trim().is_empty() {
                    None
                } else {
                    Some(logs)
                }
            }
            Ok(output) => {
                debug!(container = name, exit_code = output.exit_code, "no logs available");
                None
            }
            Err(e) => {
                error!(container = name, error = %e, "failed to fetch logs");
                None
            }
        }
    }

    async fn prepare_launch(&self, name: &str, request: &StartJobRequest) -> Result<LaunchPlan> {
        request.job_func.validate()?;
        let instance = self.resolver.resolve(&request.trajectory_id).await?;
        let image = resolve_image(
            request.image.as_deref(),
            &self.config,
            &instance,
            &request.trajectory_id,
        );
        let host_env = self.env_source.snapshot();

        LaunchPlan::build(
            &self.config,
            &ProvisionInput {
                resource_name: name,
                project_id: &request.project_id,
                trajectory_id: &request.trajectory_id,
                job_func: &request.job_func,
                node_id: request.node_id,
                image: &image,
                instance: &instance,
                memory_limit: request.memory_limit.as_deref(),
                memory_swap_limit: request.memory_swap_limit.as_deref(),
                trace_context: &request.trace_context,
                host_env: &host_env,
            },
        )
    }

    async fn start_locked(&self, name: &str, request: &StartJobRequest) -> Result<bool> {
        let project_id = request.project_id.as_str();
        let trajectory_id = request.trajectory_id.as_str();

        let presence = match self.inspect_state(name).await {
            Ok(presence) => presence,
            Err(e) => {
                error!(project_id, trajectory_id, container = name, error = %e, "failed to inspect container");
                return Err(e.into());
            }
        };

        match presence {
            Presence::Missing => {}
            Presence::Found(raw) => {
                let status = map_container_state(&raw);
                match status {
                    JobStatus::Completed
                    | JobStatus::Failed
                    | JobStatus::Canceled
                    | JobStatus::Pending => {
                        info!(project_id, trajectory_id, container = name, status = %status, "replacing previous container");
                        if !self.remove_container(name).await {
                            warn!(project_id, trajectory_id, container = name, "could not remove previous container");
                            return Ok(false);
                        }
                    }
                    JobStatus::Running | JobStatus::Stopped => {
                        info!(project_id, trajectory_id, container = name, status = %status, "job already exists");
                        return Ok(false);
                    }
                }
            }
            Presence::Stale(state) => {
                warn!(project_id, trajectory_id, container = name, state = %state, "replacing container with unreadable state");
                if !self.remove_container(name).await {
                    return Ok(false);
                }
            }
            Presence::Unavailable => {
                warn!(project_id, trajectory_id, container = name, "cannot determine existing container state, not starting");
                return Ok(false);
            }
        }

        let plan = match self.prepare_launch(name, request).await {
            Ok(plan) => plan,
            Err(e) => {
                error!(project_id, trajectory_id, error = %e, "failed to provision job");
                return Err(e);
            }
        };

        info!(
            project_id,
            trajectory_id,
            container = name,
            image = %plan.image,
            job_func = %request.job_func,
            "starting job container"
        );

        let output = match self.engine.run(&plan.args).await {
            Ok(output) => output,
            Err(e) => {
                error!(project_id, trajectory_id, container = name, error = %e, "failed to launch container");
                return Err(e.into());
            }
        };

        if !output.success() {
            error!(
                project_id,
                trajectory_id,
                container = name,
                exit_code = output.exit_code,
                output = %output.combined().trim(),
                "container launch rejected"
            );
            return Ok(false);
        }

        info!(
            project_id,
            trajectory_id,
            container = name,
            container_id = %output.stdout.trim(),
            "job container started"
        );
        Ok(true)
    }

    async fn list_resources(&self, project_id: Option<&str>) -> Vec<ListedResource> {
        let managed = managed_filter();
        let mut args = vec!["ps", "-a", "--filter", managed.as_str()];
        let project = project_id.map(project_filter);
        if let Some(project) = &project {
            args.extend(["--filter", project.as_str()]);
        }
        args.extend(["--format", LIST_FORMAT]);

        let output = match self.exec(&args).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                warn!(stderr = %output.stderr.trim(), "failed to list containers");
                return Vec::new();
            }
            Err(e) => {
                error!(error = %e, "failed to list containers");
                return Vec::new();
            }
        };

        output
            .stdout
            .lines()
            .filter_map(parse_list_line)
            .filter(|r| project_id.map_or(true, |p| r.belongs_to(p)))
            .collect()
    }
}

fn parse_list_line(line: &str) -> Option<ListedResource> {
    let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(FIELD_SEPARATOR).collect();
    if fields.len() < 7 {
        return None;
    }

    let name = fields[0].trim();
    let (raw_project, raw_trajectory) = (fields[3].trim(), fields[4].trim());
    let raw_ids = !raw_project.is_empty() && !raw_trajectory.is_empty();
    let (project_id, trajectory_id) = if raw_ids {
        (raw_project.to_string(), raw_trajectory.to_string())
    } else {
        (fields[1].trim().to_string(), fields[2].trim().to_string())
    };

    if name.is_empty() || project_id.is_empty() || trajectory_id.is_empty() {
        debug!(line, "skipping container without identity labels");
        return None;
    }

    Some(ListedResource {
        name: name.to_string(),
        project_id,
        trajectory_id,
        raw_ids,
        created_at: parse_created_at(fields[6]),
    })
}

/// Parse the `ps` CreatedAt column, e.g. `2024-05-01 10:00:00 +0000 UTC`
fn parse_created_at(value: &str) -> Option<DateTime<Utc>> {
    const FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_str(value, FORMAT) {
        return Some(dt.with_timezone(&Utc));
    }
    // Trailing zone name
    if let Some((head, _)) = value.rsplit_once(' ') {
        if let Ok(dt) = DateTime::parse_from_str(head, FORMAT) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn job_info(resource: &ListedResource, raw: &RawContainerState) -> JobInfo {
    let status = map_container_state(raw);
    let enqueued_at = resource.created_at.unwrap_or_else(|| {
        warn!(container = %resource.name, "unparseable creation time, using now");
        Utc::now()
    });
    let ended_at = if status.is_terminal() {
        Some(parse_engine_timestamp(&raw.finished_at).unwrap_or_else(Utc::now))
    } else {
        None
    };

    JobInfo {
        id: job_id(&resource.project_id, &resource.trajectory_id),
        project_id: resource.project_id.clone(),
        trajectory_id: resource.trajectory_id.clone(),
        status,
        enqueued_at,
        started_at: parse_engine_timestamp(&raw.started_at),
        ended_at,
    }
}

#[async_trait]
impl Runner for DockerRunner {
    async fn start_job(&self, request: StartJobRequest) -> Result<bool> {
        let name = self.resource_name(&request.project_id, &request.trajectory_id);

        // Released on drop, including when the caller abandons this future
        let Some(_guard) = self.start_lock.try_acquire(&name).await else {
            info!(
                project_id = %request.project_id,
                trajectory_id = %request.trajectory_id,
                container = %name,
                "start already in progress"
            );
            return Ok(false);
        };

        self.start_locked(&name, &request).await
    }

    async fn get_jobs(&self, project_id: Option<&str>) -> Vec<JobInfo> {
        let resources = self.list_resources(project_id).await;
        let lookups: Vec<_> = resources.iter().map(|r| self.observe(&r.name)).collect();
        let presences: Vec<Presence> = stream::iter(lookups)
            .buffered(INSPECT_CONCURRENCY)
            .collect()
            .await;

        resources
            .iter()
            .zip(presences)
            .filter_map(|(resource, presence)| match presence {
                Presence::Found(raw) => Some(job_info(resource, &raw)),
                _ => {
                    debug!(container = %resource.name, "skipping container without readable state");
                    None
                }
            })
            .collect()
    }

    async fn get_job_status(&self, project_id: &str, trajectory_id: &str) -> Option<JobStatus> {
        let name = self.resource_name(project_id, trajectory_id);
        match self.observe(&name).await {
            Presence::Found(raw) => Some(map_container_state(&raw)),
            Presence::Stale(state) => {
                warn!(project_id, trajectory_id, container = %name, state = %state, "unreadable container state");
                None
            }
            Presence::Missing | Presence::Unavailable => None,
        }
    }

    async fn cancel_job(&self, project_id: &str, trajectory_id: Option<&str>) {
        if let Some(trajectory_id) = trajectory_id {
            info!(project_id, trajectory_id, "canceling job");
            self.cleanup_job(project_id, trajectory_id).await;
            return;
        }

        let managed = managed_filter();
        let project = project_filter(project_id);
        let output = match self
            .exec(&[
                "ps", "-a", "--filter", managed.as_str(), "--filter", project.as_str(), "--format", CANCEL_FORMAT,
            ])
            .await
        {
            Ok(output) if output.success() => output,
            Ok(output) => {
                warn!(project_id, stderr = %output.stderr.trim(), "failed to list project containers");
                return;
            }
            Err(e) => {
                error!(project_id, error = %e, "failed to list project containers");
                return;
            }
        };

        let ids: Vec<&str> = output
            .stdout
            .lines()
            .filter_map(|line| {
                let (id, raw_project) = line.split_once(FIELD_SEPARATOR).unwrap_or((line, ""));
                let raw_project = raw_project.trim();
                let id = id.trim();
                (!id.is_empty() && (raw_project.is_empty() || raw_project == project_id))
                    .then_some(id)
            })
            .collect();

        if ids.is_empty() {
            info!(project_id, "no containers to cancel");
            return;
        }

        info!(project_id, count = ids.len(), "canceling project containers");

        let mut stop = vec!["stop"];
        stop.extend(&ids);
        match self.exec(&stop).await {
            Ok(output) if !output.success() => {
                warn!(project_id, stderr = %output.stderr.trim(), "some containers failed to stop");
            }
            Err(e) => error!(project_id, error = %e, "failed to stop project containers"),
            Ok(_) => {}
        }

        let mut rm = vec!["rm", "-f"];
        rm.extend(&ids);
        match self.exec(&rm).await {
            Ok(output) if !output.success() => {
                warn!(project_id, stderr = %output.stderr.trim(), "some containers failed to be removed");
            }
            Err(e) => error!(project_id, error = %e, "failed to remove project containers"),
            Ok(_) => {}
        }
    }

    async fn cleanup_job(&self, project_id: &str, trajectory_id: &str) -> bool {
        let name = self.resource_name(project_id, trajectory_id);
        match self.observe(&name).await {
            Presence::Missing => {
                debug!(project_id, trajectory_id, container = %name, "nothing to clean up");
                true
            }
            Presence::Unavailable => false,
            Presence::Found(_) | Presence::Stale(_) => self.remove_container(&name).await,
        }
    }

    async fn get_job_logs(&self, project_id: &str, trajectory_id: &str) -> Option<String> {
        let name = self.resource_name(project_id, trajectory_id);
        self.container_logs(&name).await
    }

    async fn get_job_details(&self, project_id: &str, trajectory_id: &str) -> Option<JobDetails> {
        let name = self.resource_name(project_id, trajectory_id);

        let output = match self.exec(&["inspect", name.as_str()]).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                if !output.is_not_found() {
                    warn!(project_id, trajectory_id, container = %name, stderr = %output.stderr.trim(), "inspect failed");
                }
                return None;
            }
            Err(e) => {
                error!(project_id, trajectory_id, container = %name, error = %e, "failed to inspect container");
                return None;
            }
        };

        let payload: Value = match serde_json::from_str(&output.stdout) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(project_id, trajectory_id, container = %name, error = %e, "unparseable inspect output");
                return None;
            }
        };
        let inspect = match &payload {
            Value::Array(items) => items.first()?,
            other => other,
        };

        let raw = RawContainerState::from_inspect_state(inspect.get("State")?)?;
        let status = map_container_state(&raw);
        let logs = self.container_logs(&name).await;

        Some(build_job_details(DetailsInput {
            project_id,
            trajectory_id,
            status,
            inspect,
            logs: logs.as_deref(),
        }))
    }

    async fn get_runner_info(&self) -> RunnerInfo {
        let version = match self
            .exec(&["info", "--format", SERVER_VERSION_FORMAT])
            .await
        {
            Ok(output) if output.success() => output.stdout.trim().to_string(),
            Ok(output) => {
                let message = output.combined().trim().to_string();
                error!(error = %message, "container engine unavailable");
                return RunnerInfo::error(RUNNER_TYPE, message);
            }
            Err(e) => {
                error!(error = %e, "container engine unavailable");
                return RunnerInfo::error(RUNNER_TYPE, e.to_string());
            }
        };

        let managed = managed_filter();
        let running = match self.exec(&["ps", "-q", "--filter", managed.as_str()]).await {
            Ok(output) if output.success() => {
                output.stdout.lines().filter(|l| !l.trim().is_empty()).count()
            }
            _ => 0,
        };

        let mut data = Map::new();
        data.insert("server_version".to_string(), json!(version));
        data.insert("managed_jobs".to_string(), json!(running));
        data.insert("network".to_string(), json!(self.config.network_name));
        data.insert(
            "platform".to_string(),
            json!(self.config.platform_override().unwrap_or_else(|| "native".to_string())),
        );
        RunnerInfo::running(RUNNER_TYPE, data)
    }
}
