/// Environment provisioner: assembles the per-job launch configuration.
///
/// Inputs are the resolved runner configuration, a snapshot of the host
/// environment taken at start time, and the per-job overrides. The output is
/// the complete `run` argument vector. The engine is never invoked here.
use crate::error::Result;
use crate::instance::InstanceMetadata;
use crate::job::{JobArgs, JobDescriptor, JobFunction};
use dockyard_common::config::{EnvSnapshot, RunnerConfig};
use dockyard_common::identity::JobLabels;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// In-container filesystem layout
pub mod layout {
    pub const DATA_DIR: &str = "/data/dockyard";
    pub const SOURCE_DIR: &str = "/opt/dockyard/source";
    pub const COMPONENTS_DIR: &str = "/opt/components";
    pub const WORKSPACE_DIR: &str = "/workspace";
    pub const NLTK_DATA_DIR: &str = "/data/nltk_data";
    pub const UPDATE_SCRIPT: &str = "/opt/dockyard/source/docker/update.sh";
}

/// Hostname under which a job reaches services on the host
pub const CONTAINER_HOST_ALIAS: &str = "host.docker.internal";

/// Prefix for forwarded trace-context entries
pub const TRACE_ENV_PREFIX: &str = "OTEL_";

const CREDENTIAL_SUFFIXES: &[&str] = &["API_KEY"];
const CREDENTIAL_PREFIXES: &[&str] = &["AWS_", "GCP_", "AZURE_"];

lazy_static! {
    static ref LOCALHOST_URL: Regex =
        Regex::new(r"(?i)^([a-z][a-z0-9+.-]*://)?(?:localhost|127\.0\.0\.1)(:\d+)?(/.*)?$")
            .expect("localhost pattern is valid");
}

/// Supplies the host environment at start time
pub trait EnvSource: Send + Sync {
    fn snapshot(&self) -> EnvSnapshot;
}

/// Reads the live process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn snapshot(&self) -> EnvSnapshot {
        EnvSnapshot::capture()
    }
}

/// Fixed environment
#[derive(Debug, Clone, Default)]
pub struct StaticEnv(pub EnvSnapshot);

impl EnvSource for StaticEnv {
    fn snapshot(&self) -> EnvSnapshot {
        self.0.clone()
    }
}

/// Rewrite a localhost URL so a job container can reach the host service
///
/// Scheme, port and path are preserved; anything that does not point at
/// `localhost` or `127.0.0.1` is returned unchanged.
pub fn rewrite_localhost_url(url: &str) -> String {
    let Some(caps) = LOCALHOST_URL.captures(url.trim()) else {
        return url.to_string();
    };

    let scheme = caps.get(1).map_or("", |m| m.as_str());
    let port = caps.get(2).map_or("", |m| m.as_str());
    let path = caps.get(3).map_or("", |m| m.as_str());
    let converted = format!("{}{}{}{}", scheme, CONTAINER_HOST_ALIAS, port, path);

    info!(original = url, converted = %converted, "rewrote localhost url for container access");
    converted
}

/// Host variables forwarded to every job by name pattern
pub fn is_forwarded_credential(key: &str) -> bool {
    CREDENTIAL_SUFFIXES.iter().any(|s| key.ends_with(s))
        || CREDENTIAL_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Pick the job image
///
/// explicit per-call image > runner default > instance metadata > derived name
pub fn resolve_image(
    explicit: Option<&str>,
    config: &RunnerConfig,
    instance: &InstanceMetadata,
    trajectory_id: &str,
) -> String {
    explicit
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .or_else(|| config.default_image.clone())
        .or_else(|| instance.image.clone())
        .unwrap_or_else(|| {
            format!(
                "{}/{}",
                config.image_prefix.trim_end_matches('/'),
                trajectory_id.to_ascii_lowercase()
            )
        })
}

/// Effective `(memory, memory+swap)` limits
///
/// Per-job values beat runner values. With a memory limit but no swap value,
/// swap equals memory.
pub fn effective_memory_limits(
    memory_limit: Option<&str>,
    memory_swap_limit: Option<&str>,
    config: &RunnerConfig,
) -> (Option<String>, Option<String>) {
    let memory = memory_limit
        .map(str::to_string)
        .or_else(|| config.memory_limit.clone());
    let swap = memory_swap_limit
        .map(str::to_string)
        .or_else(|| config.memory_swap_limit.clone())
        .or_else(|| memory.clone());
    (memory, swap)
}

/// Quote for `sh -c`, leaving plain words untouched
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._/-:@=+,".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Compose the single shell command run inside the container
///
/// self-update (only without a mounted source tree) → checkout of the base
/// commit → dependency sync → dispatch of the job descriptor.
pub fn compose_entrypoint(config: &RunnerConfig, instance: &InstanceMetadata) -> String {
    let mut steps = Vec::new();

    if config.update_on_start && config.source_dir.is_none() {
        steps.push(format!(
            "{} --branch {}",
            layout::UPDATE_SCRIPT,
            shell_quote(&config.update_branch)
        ));
    }

    let repo_dir = format!("{}/{}", layout::WORKSPACE_DIR, instance.repo_name());
    let commit = instance.base_commit.as_deref().unwrap_or("HEAD");
    steps.push(format!(
        "cd {} && git checkout {}",
        shell_quote(&repo_dir),
        shell_quote(commit)
    ));
    steps.push(format!(
        "pip install --quiet uv && cd {} && uv sync",
        layout::SOURCE_DIR
    ));
    steps.push("echo \"Starting job at $(date '+%Y-%m-%d %H:%M:%S')\"".to_string());
    steps.push(format!(
        "uv run python -m {}",
        shell_quote(&config.dispatch_module)
    ));

    steps.join(" && ")
}

/// Everything the provisioner needs for one job
#[derive(Debug, Clone)]
pub struct ProvisionInput<'a> {
    pub resource_name: &'a str,
    pub project_id: &'a str,
    pub trajectory_id: &'a str,
    pub job_func: &'a JobFunction,
    pub node_id: Option<u64>,
    pub image: &'a str,
    pub instance: &'a InstanceMetadata,
    pub memory_limit: Option<&'a str>,
    pub memory_swap_limit: Option<&'a str>,
    pub trace_context: &'a BTreeMap<String, String>,
    pub host_env: &'a EnvSnapshot,
}

/// Complete launch configuration for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub resource_name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub entrypoint: String,
    /// Full argument vector for the engine, starting with `run`
    pub args: Vec<String>,
}

impl LaunchPlan {
    pub fn build(config: &RunnerConfig, input: &ProvisionInput<'_>) -> Result<Self> {
        input.job_func.validate()?;

        let env = job_env(config, input)?;
        let entrypoint = compose_entrypoint(config, input.instance);

        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            input.resource_name.to_string(),
            "-d".to_string(),
            "--network".to_string(),
            config.network_name.clone(),
        ];

        match config.platform_override() {
            Some(platform) => {
                debug!(platform = %platform, "image architecture differs from host, emulating");
                args.push(format!("--platform={}", platform));
            }
            None => debug!("using engine default platform"),
        }

        let (memory, swap) =
            effective_memory_limits(input.memory_limit, input.memory_swap_limit, config);
        if let Some(memory) = memory {
            args.extend(["--memory".to_string(), memory]);
        }
        if let Some(swap) = swap {
            args.extend(["--memory-swap".to_string(), swap]);
        }

        args.extend(JobLabels::new(input.project_id, input.trajectory_id).to_args());

        for (key, value) in &env {
            args.extend(["-e".to_string(), format!("{}={}", key, value)]);
        }

        args.extend([
            "--add-host".to_string(),
            format!("{}:{}", CONTAINER_HOST_ALIAS, config.host_gateway),
        ]);

        if let Some(data_dir) = &config.data_dir {
            args.extend(["-v".to_string(), format!("{}:{}", data_dir.display(), layout::DATA_DIR)]);
        }
        if let Some(components_dir) = &config.components_dir {
            args.extend([
                "-v".to_string(),
                format!("{}:{}", components_dir.display(), layout::COMPONENTS_DIR),
            ]);
        }
        if let Some(source_dir) = &config.source_dir {
            info!(source = %source_dir.display(), target = layout::SOURCE_DIR, "mounting source tree");
            args.extend([
                "-v".to_string(),
                format!("{}:{}", source_dir.display(), layout::SOURCE_DIR),
            ]);
        }

        args.extend([
            input.image.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            entrypoint.clone(),
        ]);

        Ok(Self {
            resource_name: input.resource_name.to_string(),
            image: input.image.to_string(),
            env,
            entrypoint,
            args,
        })
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn job_env(config: &RunnerConfig, input: &ProvisionInput<'_>) -> Result<Vec<(String, String)>> {
    let trajectory_id = input.trajectory_id;
    let repo_dir = format!("{}/{}", layout::WORKSPACE_DIR, input.instance.repo_name());
    let descriptor = JobDescriptor::new(
        input.job_func,
        JobArgs {
            project_id: input.project_id.to_string(),
            trajectory_id: trajectory_id.to_string(),
            node_id: input.node_id,
        },
    );

    let mut env: Vec<(String, String)> = vec![
        ("PROJECT_ID".into(), input.project_id.to_string()),
        ("TRAJECTORY_ID".into(), trajectory_id.to_string()),
        ("JOB_FUNC".into(), input.job_func.qualified_name()),
        ("JOB_DESCRIPTOR".into(), descriptor.encode()?),
        ("DATA_DIR".into(), layout::DATA_DIR.to_string()),
        ("SOURCE_DIR".into(), layout::SOURCE_DIR.to_string()),
        ("NLTK_DATA".into(), layout::NLTK_DATA_DIR.to_string()),
        (
            "INDEX_STORE_DIR".into(),
            format!("{}/index_store/{}", layout::SOURCE_DIR, trajectory_id),
        ),
        ("REPO_DIR".into(), repo_dir.clone()),
        ("REPO_PATH".into(), repo_dir),
        (
            "INSTANCE_PATH".into(),
            format!("{}/instances/{}.json", layout::SOURCE_DIR, trajectory_id),
        ),
        ("SKIP_CONDA_ACTIVATE".into(), "true".to_string()),
        // Empty value makes uv ignore any inherited virtualenv
        ("VIRTUAL_ENV".into(), String::new()),
        ("UV_NO_VENV".into(), "1".to_string()),
    ];

    if config.components_dir.is_some() {
        env.push(("COMPONENTS_PATH".into(), layout::COMPONENTS_DIR.to_string()));
    }

    if config.source_dir.is_some() {
        // The mounted tree must shadow any copy baked into the image
        env.push(("PYTHONPATH".into(), layout::SOURCE_DIR.to_string()));
    }

    if let Some(redis_url) = input.host_env.get("REDIS_URL") {
        env.push(("REDIS_URL".into(), rewrite_localhost_url(redis_url)));
    }

    for (key, value) in input.host_env.iter() {
        if is_forwarded_credential(key) && !env.iter().any(|(k, _)| k == key) {
            env.push((key.to_string(), value.to_string()));
        }
    }

    for (key, value) in input.trace_context {
        env.push((format!("{}{}", TRACE_ENV_PREFIX, key), value.clone()));
    }

    Ok(env)
}
