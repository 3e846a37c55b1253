/// Job details aggregator: turns one container inspection payload into the
/// structured, sectioned report returned by `get_job_details`.
use crate::provision::is_forwarded_credential;
use dockyard_common::identity::job_id;
use dockyard_common::status::parse_engine_timestamp;
use dockyard_common::types::{JobDetailSection, JobDetails, JobStatus};
use serde_json::{json, Map, Value};

pub const REDACTED: &str = "********";

/// Env keys containing any of these are never shown
const SENSITIVE_KEY_MARKERS: &[&str] = &["KEY", "PASSWORD", "SECRET", "TOKEN", "CREDENTIAL"];

const CONTAINER_ID_LEN: usize = 12;

#[derive(Debug, Clone, Copy)]
pub struct DetailsInput<'a> {
    pub project_id: &'a str,
    pub trajectory_id: &'a str,
    pub status: JobStatus,
    /// Single inspect object (not the surrounding array)
    pub inspect: &'a Value,
    pub logs: Option<&'a str>,
}

/// Credential-looking keys, and everything forwarded from the host as a credential
pub fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SENSITIVE_KEY_MARKERS.iter().any(|m| upper.contains(m)) || is_forwarded_credential(&upper)
}

pub fn build_job_details(input: DetailsInput<'_>) -> JobDetails {
    let inspect = input.inspect;
    let config = inspect.get("Config").unwrap_or(&Value::Null);
    let state = inspect.get("State").unwrap_or(&Value::Null);
    let network = inspect.get("NetworkSettings").unwrap_or(&Value::Null);

    let created = str_field(inspect, "Created");
    let mut sections = Vec::new();

    let container_id: String = str_field(inspect, "Id").chars().take(CONTAINER_ID_LEN).collect();
    sections.push(JobDetailSection::with_data(
        "overview",
        "Overview",
        object(json!({
            "container_id": container_id,
            "image": str_field(config, "Image"),
            "command": config.get("Cmd").cloned().unwrap_or_else(|| json!([])),
            "created_at": created,
            "status": str_field(state, "Status"),
            "platform": str_field(inspect, "Platform"),
            "driver": str_field(inspect, "Driver"),
        })),
    ));

    sections.push(JobDetailSection::with_data(
        "state",
        "Container State",
        object(state.clone()),
    ));

    sections.push(JobDetailSection::with_data(
        "environment",
        "Environment",
        environment(config),
    ));

    sections.push(JobDetailSection::with_data(
        "labels",
        "Labels",
        object(config.get("Labels").cloned().unwrap_or(Value::Null)),
    ));

    sections.push(JobDetailSection::with_data(
        "networking",
        "Networking",
        object(json!({
            "ip_address": str_field(network, "IPAddress"),
            "gateway": str_field(network, "Gateway"),
            "ports": network.get("Ports").cloned().unwrap_or_else(|| json!({})),
            "networks": network.get("Networks").cloned().unwrap_or_else(|| json!({})),
        })),
    ));

    if let Some(mounts) = inspect.get("Mounts").and_then(Value::as_array) {
        if !mounts.is_empty() {
            sections.push(JobDetailSection::with_items("mounts", "Mounts", mounts.clone()));
        }
    }

    if let Some(logs) = input.logs.filter(|l| !l.is_empty()) {
        sections.push(JobDetailSection::with_data(
            "logs",
            "Logs",
            object(json!({ "logs": logs })),
        ));
    }

    let mut error = None;
    if input.status == JobStatus::Failed {
        let exit_code = state.get("ExitCode").and_then(Value::as_i64).unwrap_or(0);
        let engine_error = str_field(state, "Error");
        let oom_killed = state.get("OOMKilled").and_then(Value::as_bool).unwrap_or(false);

        error = Some(if engine_error.is_empty() {
            format!("Container exited with code {}", exit_code)
        } else {
            format!("Container exited with code {}: {}", exit_code, engine_error)
        });

        sections.push(JobDetailSection::with_data(
            "error",
            "Error",
            object(json!({
                "exit_code": exit_code,
                "error": engine_error,
                "oom_killed": oom_killed,
            })),
        ));
    }

    JobDetails {
        id: job_id(input.project_id, input.trajectory_id),
        project_id: input.project_id.to_string(),
        trajectory_id: input.trajectory_id.to_string(),
        status: input.status,
        enqueued_at: parse_engine_timestamp(created),
        started_at: parse_engine_timestamp(str_field(state, "StartedAt")),
        ended_at: parse_engine_timestamp(str_field(state, "FinishedAt")),
        sections,
        raw_data: inspect.clone(),
        error,
    }
}

fn environment(config: &Value) -> Map<String, Value> {
    let mut env = Map::new();
    let entries = config.get("Env").and_then(Value::as_array);
    for entry in entries.into_iter().flatten().filter_map(Value::as_str) {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        let value = if is_sensitive_key(key) { REDACTED } else { value };
        env.insert(key.to_string(), Value::String(value.to_string()));
    }
    env
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspect_payload(status: &str, exit_code: i64, error: &str) -> Value {
        json!({
            "Id": "4f1c2a9b8e7d6c5b4a3f2e1d",
            "Created": "2024-05-01T09:59:58.1Z",
            "Platform": "linux",
            "Driver": "overlay2",
            "State": {
                "Status": status,
                "Running": false,
                "ExitCode": exit_code,
                "Error": error,
                "OOMKilled": false,
                "StartedAt": "2024-05-01T10:00:00Z",
                "FinishedAt": "2024-05-01T10:05:00Z"
            },
            "Config": {
                "Image": "ghcr.io/dockyard-images/t1",
                "Cmd": ["sh", "-c", "uv run python -m dockyard_worker.dispatch"],
                "Env": [
                    "PROJECT_ID=proj",
                    "OPENAI_API_KEY=sk-live",
                    "DB_PASSWORD=hunter2",
                    "GITHUB_TOKEN=ghp_x",
                    "client_secret=s3",
                    "AZURE_OPENAI_KEY=sk-azure",
                    "AWS_ACCESS_KEY_ID=AKIAXXXX",
                    "AWS_REGION=us-east-1",
                    "GCP_CREDENTIALS=/secrets/gcp.json",
                    "azure_endpoint=https://example.openai.azure.com",
                    "EMPTY=",
                    "MALFORMED"
                ],
                "Labels": {"dockyard.managed": "true", "project_id": "proj"}
            },
            "NetworkSettings": {
                "IPAddress": "172.18.0.4",
                "Gateway": "172.18.0.1",
                "Ports": {},
                "Networks": {"dockyard-network": {}}
            },
            "Mounts": []
        })
    }

    fn build(payload: &Value, status: JobStatus, logs: Option<&str>) -> JobDetails {
        build_job_details(DetailsInput {
            project_id: "proj",
            trajectory_id: "t1",
            status,
            inspect: payload,
            logs,
        })
    }

    #[test]
    fn test_sections_in_order() {
        let payload = inspect_payload("exited", 0, "");
        let details = build(&payload, JobStatus::Completed, Some("hello\n"));

        let names: Vec<&str> = details.sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["overview", "state", "environment", "labels", "networking", "logs"]
        );
        assert_eq!(details.id, "proj:t1");
        assert!(details.error.is_none());

        let overview = details.section("overview").unwrap().data.as_ref().unwrap();
        assert_eq!(overview["container_id"], "4f1c2a9b8e7d");
        assert_eq!(overview["image"], "ghcr.io/dockyard-images/t1");

        let networking = details.section("networking").unwrap().data.as_ref().unwrap();
        assert_eq!(networking["ip_address"], "172.18.0.4");
    }

    #[test]
    fn test_environment_redaction() {
        let payload = inspect_payload("exited", 0, "");
        let details = build(&payload, JobStatus::Completed, None);
        let env = details.section("environment").unwrap().data.as_ref().unwrap();

        assert_eq!(env["PROJECT_ID"], "proj");
        assert_eq!(env["OPENAI_API_KEY"], REDACTED);
        assert_eq!(env["DB_PASSWORD"], REDACTED);
        assert_eq!(env["GITHUB_TOKEN"], REDACTED);
        assert_eq!(env["client_secret"], REDACTED);
        assert_eq!(env["AZURE_OPENAI_KEY"], REDACTED);
        assert_eq!(env["AWS_ACCESS_KEY_ID"], REDACTED);
        assert_eq!(env["GCP_CREDENTIALS"], REDACTED);
        // Forwarded from the host, so hidden even without a credential marker
        assert_eq!(env["AWS_REGION"], REDACTED);
        assert_eq!(env["azure_endpoint"], REDACTED);
        assert_eq!(env["EMPTY"], "");
        assert!(!env.contains_key("MALFORMED"));
    }

    #[test]
    fn test_failed_job_error_section() {
        let payload = inspect_payload("exited", 137, "");
        let details = build(&payload, JobStatus::Failed, None);

        assert_eq!(details.error.as_deref(), Some("Container exited with code 137"));
        let error = details.section("error").unwrap().data.as_ref().unwrap();
        assert_eq!(error["exit_code"], 137);
        assert_eq!(error["oom_killed"], false);

        let payload = inspect_payload("exited", 1, "mount failed");
        let details = build(&payload, JobStatus::Failed, None);
        assert_eq!(
            details.error.as_deref(),
            Some("Container exited with code 1: mount failed")
        );
    }

    #[test]
    fn test_optional_sections_and_timestamps() {
        let mut payload = inspect_payload("running", 0, "");
        payload["State"]["FinishedAt"] = json!("0001-01-01T00:00:00Z");
        payload["Mounts"] = json!([{"Source": "/srv/data", "Destination": "/data/dockyard"}]);

        let details = build(&payload, JobStatus::Running, Some(""));
        assert!(details.section("mounts").is_some());
        assert!(details.section("logs").is_none());
        assert!(details.section("error").is_none());
        assert!(details.enqueued_at.is_some());
        assert!(details.started_at.is_some());
        assert!(details.ended_at.is_none());
        assert_eq!(details.raw_data, payload);
    }
}
