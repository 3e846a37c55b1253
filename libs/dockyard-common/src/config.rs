use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_JOB_TTL_SECONDS: u64 = 3600;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;
pub const DEFAULT_IMAGE_PREFIX: &str = "ghcr.io/dockyard-images";
pub const DEFAULT_UPDATE_BRANCH: &str = "main";
pub const DEFAULT_NETWORK: &str = "dockyard-network";
pub const DEFAULT_ARCHITECTURE: &str = "x86_64";
pub const DEFAULT_DOCKER_BINARY: &str = "docker";
pub const DEFAULT_HOST_GATEWAY: &str = "host-gateway";
pub const DEFAULT_DISPATCH_MODULE: &str = "dockyard_worker.dispatch";

/// Read-only view of a process environment
/// Captured once and passed down explicitly; nothing below the
/// construction boundary calls `std::env` itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Non-empty value of a variable
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// First non-empty value among several variable names
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Explicit constructor parameters for a runner
/// Any `None` field falls back to the environment, then to the default.
#[derive(Debug, Clone, Default)]
pub struct RunnerSettings {
    pub job_ttl_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub source_dir: Option<PathBuf>,
    pub default_image: Option<String>,
    pub image_prefix: Option<String>,
    pub update_on_start: Option<bool>,
    pub update_branch: Option<String>,
    pub network_name: Option<String>,
    pub memory_limit: Option<String>,
    pub memory_swap_limit: Option<String>,
    pub architecture: Option<String>,
    pub host_architecture: Option<String>,
    pub components_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub docker_binary: Option<String>,
    pub host_gateway: Option<String>,
    pub name_prefix: Option<String>,
    pub dispatch_module: Option<String>,
}

/// Resolved runner configuration
///
/// ## Precedence
/// explicit parameter > environment variable(s) > default
///
/// `job_ttl_seconds` and `timeout_seconds` are policy knobs for an external
/// reaper; the runner itself never enforces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub job_ttl_seconds: u64,
    pub timeout_seconds: u64,
    /// Host path of the orchestrator source tree mounted into each job
    pub source_dir: Option<PathBuf>,
    pub default_image: Option<String>,
    pub image_prefix: String,
    pub update_on_start: bool,
    pub update_branch: String,
    pub network_name: String,
    pub memory_limit: Option<String>,
    pub memory_swap_limit: Option<String>,
    /// Architecture the job images are built for
    pub architecture: String,
    pub host_architecture: String,
    pub components_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub docker_binary: String,
    pub host_gateway: String,
    pub name_prefix: String,
    pub dispatch_module: String,
}

impl RunnerConfig {
    pub fn resolve(settings: RunnerSettings, env: &EnvSnapshot) -> Self {
        Self {
            job_ttl_seconds: settings.job_ttl_seconds.unwrap_or_else(|| {
                parse_env(env, "DOCKYARD_JOB_TTL_SECONDS", DEFAULT_JOB_TTL_SECONDS)
            }),
            timeout_seconds: settings.timeout_seconds.unwrap_or_else(|| {
                parse_env(env, "DOCKYARD_JOB_TIMEOUT_SECONDS", DEFAULT_TIMEOUT_SECONDS)
            }),
            source_dir: settings.source_dir.or_else(|| {
                env.first_of(&["DOCKYARD_HOST_SOURCE_DIR", "DOCKYARD_SOURCE_DIR"])
                    .map(PathBuf::from)
            }),
            default_image: settings
                .default_image
                .or_else(|| env.get("DOCKYARD_DEFAULT_IMAGE").map(str::to_string)),
            image_prefix: settings.image_prefix.unwrap_or_else(|| {
                string_env(env, "DOCKYARD_IMAGE_PREFIX", DEFAULT_IMAGE_PREFIX)
            }),
            update_on_start: settings
                .update_on_start
                .unwrap_or_else(|| bool_env(env, "DOCKYARD_UPDATE_ON_START", false)),
            update_branch: settings.update_branch.unwrap_or_else(|| {
                string_env(env, "DOCKYARD_UPDATE_BRANCH", DEFAULT_UPDATE_BRANCH)
            }),
            network_name: settings
                .network_name
                .unwrap_or_else(|| string_env(env, "DOCKYARD_DOCKER_NETWORK", DEFAULT_NETWORK)),
            memory_limit: settings
                .memory_limit
                .or_else(|| env.get("DOCKER_MEMORY_LIMIT").map(str::to_string)),
            memory_swap_limit: settings
                .memory_swap_limit
                .or_else(|| env.get("DOCKER_MEMORY_SWAP_LIMIT").map(str::to_string)),
            architecture: settings.architecture.unwrap_or_else(|| {
                string_env(env, "DOCKYARD_DOCKER_ARCHITECTURE", DEFAULT_ARCHITECTURE)
            }),
            host_architecture: settings
                .host_architecture
                .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
            components_dir: settings.components_dir.or_else(|| {
                env.first_of(&["DOCKYARD_HOST_COMPONENTS_PATH", "DOCKYARD_COMPONENTS_PATH"])
                    .map(PathBuf::from)
            }),
            data_dir: settings.data_dir.or_else(|| {
                env.first_of(&["DOCKYARD_HOST_DIR", "DOCKYARD_DIR"])
                    .map(PathBuf::from)
            }),
            docker_binary: settings
                .docker_binary
                .unwrap_or_else(|| string_env(env, "DOCKYARD_DOCKER_BIN", DEFAULT_DOCKER_BINARY)),
            host_gateway: settings
                .host_gateway
                .unwrap_or_else(|| string_env(env, "DOCKYARD_HOST_GATEWAY", DEFAULT_HOST_GATEWAY)),
            name_prefix: settings.name_prefix.unwrap_or_else(|| {
                string_env(env, "DOCKYARD_NAME_PREFIX", crate::identity::DEFAULT_NAME_PREFIX)
            }),
            dispatch_module: settings.dispatch_module.unwrap_or_else(|| {
                string_env(env, "DOCKYARD_DISPATCH_MODULE", DEFAULT_DISPATCH_MODULE)
            }),
        }
    }

    pub fn from_env() -> Self {
        Self::resolve(RunnerSettings::default(), &EnvSnapshot::capture())
    }

    /// Platform flag value, only when host and image architectures diverge
    pub fn platform_override(&self) -> Option<String> {
        let host = normalize_architecture(&self.host_architecture);
        let target = normalize_architecture(&self.architecture);
        if host == target {
            None
        } else {
            Some(format!("linux/{}", target))
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Collapse architecture aliases onto the engine's platform names
pub fn normalize_architecture(arch: &str) -> String {
    match arch.trim().to_ascii_lowercase().as_str() {
        "x86_64" | "amd64" | "x64" => "amd64".to_string(),
        "aarch64" | "arm64" | "arm64v8" => "arm64".to_string(),
        other => other.to_string(),
    }
}

fn string_env(env: &EnvSnapshot, key: &str, default: &str) -> String {
    env.get(key).unwrap_or(default).to_string()
}

fn parse_env<T: std::str::FromStr>(env: &EnvSnapshot, key: &str, default: T) -> T {
    match env.get(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = raw, "ignoring unparseable setting, using default");
            default
        }),
        None => default,
    }
}

fn bool_env(env: &EnvSnapshot, key: &str, default: bool) -> bool {
    match env.get(key).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        Some(v) => {
            warn!(key, value = %v, "ignoring unparseable flag, using default");
            default
        }
        None => default,
    }
}
