/// Task instance metadata: which repository a trajectory works on, at which
/// commit, and optionally which image it needs.
use crate::error::{Result, RunnerError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    /// `owner/name` of the task repository
    pub repo: String,
    #[serde(default)]
    pub base_commit: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

impl InstanceMetadata {
    /// Last path segment of `repo`, used as the workspace directory name
    pub fn repo_name(&self) -> &str {
        self.repo.rsplit('/').next().unwrap_or(&self.repo)
    }
}

/// Source of instance metadata, keyed by trajectory id
#[async_trait]
pub trait InstanceResolver: Send + Sync {
    async fn resolve(&self, trajectory_id: &str) -> Result<InstanceMetadata>;
}

/// Reads `{dir}/{trajectory_id}.json`
#[derive(Debug, Clone)]
pub struct JsonInstanceResolver {
    dir: PathBuf,
}

impl JsonInstanceResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl InstanceResolver for JsonInstanceResolver {
    async fn resolve(&self, trajectory_id: &str) -> Result<InstanceMetadata> {
        let instance_error = |reason: String| RunnerError::Instance {
            trajectory_id: trajectory_id.to_string(),
            reason,
        };

        if trajectory_id.contains(['/', '\\']) || trajectory_id.starts_with('.') {
            return Err(instance_error("trajectory id is not a plain file name".to_string()));
        }

        let path = self.dir.join(format!("{}.json", trajectory_id));
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| instance_error(format!("{}: {}", path.display(), e)))?;

        let metadata: InstanceMetadata = serde_json::from_str(&content)
            .map_err(|e| instance_error(format!("{}: {}", path.display(), e)))?;

        if metadata.repo.trim().is_empty() {
            return Err(instance_error("instance has an empty `repo`".to_string()));
        }
        Ok(metadata)
    }
}

/// In-memory resolver
#[derive(Debug, Clone, Default)]
pub struct StaticInstanceResolver {
    instances: HashMap<String, InstanceMetadata>,
}

impl StaticInstanceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance(mut self, trajectory_id: &str, metadata: InstanceMetadata) -> Self {
        self.instances.insert(trajectory_id.to_string(), metadata);
        self
    }
}

#[async_trait]
impl InstanceResolver for StaticInstanceResolver {
    async fn resolve(&self, trajectory_id: &str) -> Result<InstanceMetadata> {
        self.instances
            .get(trajectory_id)
            .cloned()
            .ok_or_else(|| RunnerError::Instance {
                trajectory_id: trajectory_id.to_string(),
                reason: "instance not found".to_string(),
            })
    }
}
