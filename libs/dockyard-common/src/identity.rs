/// Job identity and labeling - defines only naming semantics, not runtime logic
/// Ensures every runner derives the same resource name for the same job key,
/// resource names are engine-legal, and identity survives sanitization
/// through the raw-value labels.
use sha2::{Digest, Sha256};

pub const DEFAULT_NAME_PREFIX: &str = "dockyard";

/// Marker label carried by every resource this system manages
pub const MANAGED_LABEL: &str = "dockyard.managed";
/// Sanitized identity labels, used for engine-side filtering
pub const PROJECT_LABEL: &str = "project_id";
pub const TRAJECTORY_LABEL: &str = "trajectory_id";
/// Raw identity labels, used to recover the exact key
pub const RAW_PROJECT_LABEL: &str = "dockyard.project_id";
pub const RAW_TRAJECTORY_LABEL: &str = "dockyard.trajectory_id";

const MAX_LABEL_LEN: usize = 63;
const PREFIX_SEGMENT_LEN: usize = 24;
const ID_SEGMENT_LEN: usize = 40;
const DIGEST_LEN: usize = 12;

/// Map an arbitrary identifier onto the engine's legal label charset
///
/// Output only contains `[a-z0-9._-]`, starts and ends with an
/// alphanumeric character and is at most 63 characters long.
pub fn sanitize_label(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    truncate_segment(&mapped, MAX_LABEL_LEN)
}

fn truncate_segment(value: &str, max_len: usize) -> String {
    // Input is ASCII after sanitization so byte slicing is safe
    let trimmed = value.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    let cut = &trimmed[..trimmed.len().min(max_len)];
    let cut = cut.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    if cut.is_empty() {
        "x".to_string()
    } else {
        cut.to_string()
    }
}

/// Short stable digest of the raw key
/// Disambiguates keys that sanitize or truncate to the same text
pub fn key_digest(project_id: &str, trajectory_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(trajectory_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..DIGEST_LEN].to_string()
}

/// Generate the deterministic resource name for a job
pub fn resource_name(prefix: &str, project_id: &str, trajectory_id: &str) -> String {
    format!(
        "{}-{}-{}-{}",
        truncate_segment(&sanitize_label(prefix), PREFIX_SEGMENT_LEN),
        truncate_segment(&sanitize_label(project_id), ID_SEGMENT_LEN),
        truncate_segment(&sanitize_label(trajectory_id), ID_SEGMENT_LEN),
        key_digest(project_id, trajectory_id)
    )
}

/// Generate the public job id (raw values, never sanitized)
pub fn job_id(project_id: &str, trajectory_id: &str) -> String {
    format!("{}:{}", project_id, trajectory_id)
}

/// Filter expression selecting managed resources
pub fn managed_filter() -> String {
    format!("label={}=true", MANAGED_LABEL)
}

/// Filter expression selecting one project's resources
pub fn project_filter(project_id: &str) -> String {
    format!("label={}={}", PROJECT_LABEL, sanitize_label(project_id))
}

/// Labels attached to a job's resource at creation time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLabels {
    pub project_id: String,
    pub trajectory_id: String,
}

impl JobLabels {
    pub fn new(project_id: &str, trajectory_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            trajectory_id: trajectory_id.to_string(),
        }
    }

    pub fn pairs(&self) -> Vec<(String, String)> {
        vec![
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (PROJECT_LABEL.to_string(), sanitize_label(&self.project_id)),
            (TRAJECTORY_LABEL.to_string(), sanitize_label(&self.trajectory_id)),
            (RAW_PROJECT_LABEL.to_string(), self.project_id.clone()),
            (RAW_TRAJECTORY_LABEL.to_string(), self.trajectory_id.clone()),
        ]
    }

    /// Render as `--label key=value` argument pairs
    pub fn to_args(&self) -> Vec<String> {
        self.pairs()
            .into_iter()
            .flat_map(|(key, value)| ["--label".to_string(), format!("{}={}", key, value)])
            .collect()
    }
}
