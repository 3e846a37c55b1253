/// Container Status Mapper - raw engine state to canonical JobStatus
///
/// **Critical Properties:**
/// - Knows nothing about how the engine is invoked
/// - Pure function: (raw state) → JobStatus
/// - Fail-closed: unrecognized raw states map to Failed, never an error
///
/// "Resource not found" is not a raw state. Callers report it as an absent
/// status before this mapper is ever consulted.
use crate::types::JobStatus;
use chrono::{DateTime, Utc};

/// Timestamp the engine reports for "never happened"
pub const ZERO_TIMESTAMP: &str = "0001-01-01T00:00:00Z";
/// Alternate spelling seen on `FinishedAt`
pub const ZERO_TIMESTAMP_NANOS: &str = "0001-01-01T00:00:00.000000000Z";

/// Inspect template producing the fields of `RawContainerState`, comma-separated
pub const STATE_INSPECT_FORMAT: &str = "{{.State.Status}},{{.State.Running}},{{.State.ExitCode}},{{.State.StartedAt}},{{.State.FinishedAt}}";

/// Raw container state as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContainerState {
    pub status: String,
    pub running: bool,
    pub exit_code: i64,
    pub started_at: String,
    pub finished_at: String,
}

impl RawContainerState {
    /// Parse one line of `STATE_INSPECT_FORMAT` output
    pub fn parse_inspect_line(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.trim().split(',').collect();
        if parts.len() < 5 {
            return None;
        }

        Some(Self {
            status: parts[0].trim().to_string(),
            running: parts[1].trim().eq_ignore_ascii_case("true"),
            // Unparseable exit codes count as failures
            exit_code: parts[2].trim().parse().unwrap_or(-1),
            started_at: parts[3].trim().to_string(),
            finished_at: parts[4].trim().to_string(),
        })
    }

    /// Build from the `State` object of a full inspect payload
    pub fn from_inspect_state(state: &serde_json::Value) -> Option<Self> {
        let status = state.get("Status")?.as_str()?.to_string();
        Some(Self {
            status,
            running: state.get("Running").and_then(|v| v.as_bool()).unwrap_or(false),
            exit_code: state.get("ExitCode").and_then(|v| v.as_i64()).unwrap_or(-1),
            started_at: state
                .get("StartedAt")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            finished_at: state
                .get("FinishedAt")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

pub fn is_zero_timestamp(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value == ZERO_TIMESTAMP || value == ZERO_TIMESTAMP_NANOS
}

/// Parse an engine timestamp unless it is a zero sentinel
pub fn parse_engine_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if is_zero_timestamp(value) {
        return None;
    }
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Map raw container state onto the canonical status
///
/// ## Rules (first match wins)
/// 1. started and not finished → Running, whatever the raw status says
///    (the status string can lag the timestamps)
/// 2. running flag, or running/restarting/paused → Running
/// 3. created → Pending
/// 4. exited → Completed on exit code 0, Failed otherwise
/// 5. removing → Stopped
/// 6. anything else → Failed
pub fn map_container_state(raw: &RawContainerState) -> JobStatus {
    if !is_zero_timestamp(&raw.started_at) && is_zero_timestamp(&raw.finished_at) {
        return JobStatus::Running;
    }

    if raw.running {
        return JobStatus::Running;
    }

    match raw.status.to_ascii_lowercase().as_str() {
        "running" | "restarting" | "paused" => JobStatus::Running,
        "created" => JobStatus::Pending,
        "exited" if raw.exit_code == 0 => JobStatus::Completed,
        "exited" => JobStatus::Failed,
        "removing" => JobStatus::Stopped,
        _ => JobStatus::Failed,
    }
}
