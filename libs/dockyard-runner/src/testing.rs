/// In-memory container engine for tests.
///
/// Understands the subset of engine commands the docker runner issues and
/// records every invocation so tests can assert on call shape and count.
use crate::docker::{CANCEL_FORMAT, FIELD_SEPARATOR, LIST_FORMAT};
use crate::engine::{ContainerEngine, EngineOutput};
use crate::error::EngineError;
use async_trait::async_trait;
use dockyard_common::identity::{
    JobLabels, PROJECT_LABEL, RAW_PROJECT_LABEL, RAW_TRAJECTORY_LABEL, TRAJECTORY_LABEL,
};
use dockyard_common::status::{RawContainerState, STATE_INSPECT_FORMAT, ZERO_TIMESTAMP};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const STARTED_AT: &str = "2024-05-01T10:00:00Z";
pub const FINISHED_AT: &str = "2024-05-01T10:05:00Z";
pub const CREATED_AT: &str = "2024-05-01 09:59:58 +0000 UTC";

pub fn running_state() -> RawContainerState {
    RawContainerState {
        status: "running".to_string(),
        running: true,
        exit_code: 0,
        started_at: STARTED_AT.to_string(),
        finished_at: ZERO_TIMESTAMP.to_string(),
    }
}

pub fn exited_state(exit_code: i64) -> RawContainerState {
    RawContainerState {
        status: "exited".to_string(),
        running: false,
        exit_code,
        started_at: STARTED_AT.to_string(),
        finished_at: FINISHED_AT.to_string(),
    }
}

pub fn created_state() -> RawContainerState {
    RawContainerState {
        status: "created".to_string(),
        running: false,
        exit_code: 0,
        started_at: ZERO_TIMESTAMP.to_string(),
        finished_at: ZERO_TIMESTAMP.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: Vec<String>,
    pub state: RawContainerState,
    pub logs: String,
    /// inspect --format answers with unparseable output
    pub garbled: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: Vec<FakeContainer>,
    calls: Vec<Vec<String>>,
    next_id: u64,
    run_failure: bool,
    daemon_down: bool,
}

impl FakeState {
    fn find(&self, key: &str) -> Option<usize> {
        self.containers
            .iter()
            .position(|c| c.name == key || (!key.is_empty() && c.id.starts_with(key)))
    }

    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:012x}{:052x}", self.next_id, self.next_id)
    }
}

#[derive(Debug, Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
    /// Simulated latency of every command
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

fn ok(stdout: impl Into<String>) -> EngineOutput {
    EngineOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: 0,
    }
}

fn fail(stderr: impl Into<String>, exit_code: i32) -> EngineOutput {
    EngineOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code,
    }
}

fn not_found(key: &str) -> EngineOutput {
    fail(format!("Error: No such container: {}\n", key), 1)
}

fn flag_values<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].as_str())
        .collect()
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a managed container as if a previous start had created it
    pub fn add_job(&self, name: &str, project_id: &str, trajectory_id: &str, state: RawContainerState) {
        let labels = JobLabels::new(project_id, trajectory_id).pairs().into_iter().collect();
        let mut inner = self.state.lock().unwrap();
        let id = inner.next_id();
        inner.containers.push(FakeContainer {
            id,
            name: name.to_string(),
            image: "ghcr.io/dockyard-images/test".to_string(),
            labels,
            env: vec![format!("PROJECT_ID={}", project_id)],
            state,
            logs: String::new(),
            garbled: false,
        });
    }

    pub fn add_unmanaged(&self, name: &str) {
        let mut inner = self.state.lock().unwrap();
        let id = inner.next_id();
        inner.containers.push(FakeContainer {
            id,
            name: name.to_string(),
            image: name.to_string(),
            labels: BTreeMap::new(),
            env: Vec::new(),
            state: running_state(),
            logs: String::new(),
            garbled: false,
        });
    }

    pub fn set_logs(&self, name: &str, logs: &str) {
        self.update(name, |c| c.logs = logs.to_string());
    }

    pub fn set_state(&self, name: &str, state: RawContainerState) {
        self.update(name, |c| c.state = state);
    }

    pub fn set_garbled_inspect(&self, name: &str) {
        self.update(name, |c| c.garbled = true);
    }

    pub fn set_run_failure(&self, fail: bool) {
        self.state.lock().unwrap().run_failure = fail;
    }

    pub fn set_daemon_down(&self, down: bool) {
        self.state.lock().unwrap().daemon_down = down;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Most commands observed running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Drop the raw-id labels, as on containers created before they existed
    pub fn strip_raw_labels(&self, name: &str) {
        self.update(name, |c| {
            c.labels.remove(RAW_PROJECT_LABEL);
            c.labels.remove(RAW_TRAJECTORY_LABEL);
        });
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        let inner = self.state.lock().unwrap();
        inner.find(name).map(|i| inner.containers[i].clone())
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, subcommand: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.first().map(String::as_str) == Some(subcommand))
            .collect()
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut FakeContainer)) {
        let mut inner = self.state.lock().unwrap();
        let index = inner.find(name).expect("container exists");
        f(&mut inner.containers[index]);
    }

    fn handle(&self, args: &[String]) -> EngineOutput {
        let mut inner = self.state.lock().unwrap();
        inner.calls.push(args.to_vec());

        if inner.daemon_down {
            return fail(
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
                1,
            );
        }

        let subcommand = args.first().map(String::as_str).unwrap_or_default();
        match subcommand {
            "inspect" => inspect(&inner, args),
            "run" => run(&mut inner, args),
            "ps" => ps(&inner, args),
            "stop" => {
                let mut missing = Vec::new();
                for key in &args[1..] {
                    match inner.find(key) {
                        Some(i) => {
                            let state = &mut inner.containers[i].state;
                            if state.running {
                                *state = exited_state(137);
                            }
                        }
                        None => missing.push(key.clone()),
                    }
                }
                match missing.first() {
                    Some(key) => not_found(key),
                    None => ok(args[1..].join("\n")),
                }
            }
            "rm" => {
                let mut missing = Vec::new();
                for key in args[1..].iter().filter(|a| !a.starts_with('-')) {
                    match inner.find(key) {
                        Some(i) => {
                            inner.containers.remove(i);
                        }
                        None => missing.push(key.clone()),
                    }
                }
                match missing.first() {
                    Some(key) => not_found(key),
                    None => ok(""),
                }
            }
            "logs" => match args.get(1).and_then(|key| inner.find(key)) {
                Some(i) => ok(inner.containers[i].logs.clone()),
                None => not_found(args.get(1).map(String::as_str).unwrap_or_default()),
            },
            "info" => ok("24.0.7\n"),
            other => fail(format!("unknown command: {}", other), 125),
        }
    }
}

fn inspect(inner: &FakeState, args: &[String]) -> EngineOutput {
    let Some(key) = args.last() else {
        return fail("inspect requires an argument", 1);
    };
    let Some(index) = inner.find(key) else {
        return fail(format!("Error: No such object: {}\n", key), 1);
    };
    let container = &inner.containers[index];
    let state = &container.state;

    if flag_values(args, "--format") == [STATE_INSPECT_FORMAT] {
        if container.garbled {
            return ok("<no value>\n");
        }
        return ok(format!(
            "{},{},{},{},{}\n",
            state.status, state.running, state.exit_code, state.started_at, state.finished_at
        ));
    }

    let payload = json!([{
        "Id": container.id,
        "Name": format!("/{}", container.name),
        "Created": "2024-05-01T09:59:58.000000000Z",
        "Platform": "linux",
        "Driver": "overlay2",
        "State": {
            "Status": state.status,
            "Running": state.running,
            "ExitCode": state.exit_code,
            "Error": "",
            "OOMKilled": false,
            "StartedAt": state.started_at,
            "FinishedAt": state.finished_at,
        },
        "Config": {
            "Image": container.image,
            "Cmd": ["sh", "-c", "uv run python -m dockyard_worker.dispatch"],
            "Env": container.env,
            "Labels": container.labels,
        },
        "NetworkSettings": {
            "IPAddress": "172.18.0.2",
            "Gateway": "172.18.0.1",
            "Ports": {},
            "Networks": {},
        },
        "Mounts": [],
    }]);
    ok(payload.to_string())
}

fn run(inner: &mut FakeState, args: &[String]) -> EngineOutput {
    if inner.run_failure {
        return fail(
            "Unable to find image locally\ndocker: Error response from daemon: pull access denied",
            125,
        );
    }

    let Some(name) = flag_values(args, "--name").first().map(|s| s.to_string()) else {
        return fail("--name is required", 125);
    };
    if inner.find(&name).is_some() {
        return fail(
            format!("docker: Error response from daemon: Conflict. The container name \"/{}\" is already in use.", name),
            125,
        );
    }

    let labels = flag_values(args, "--label")
        .into_iter()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let env = flag_values(args, "-e").into_iter().map(str::to_string).collect();
    // image, sh, -c, entrypoint
    let image = args.len().checked_sub(4).map(|i| args[i].clone()).unwrap_or_default();

    let id = inner.next_id();
    inner.containers.push(FakeContainer {
        id: id.clone(),
        name,
        image,
        labels,
        env,
        state: running_state(),
        logs: String::new(),
        garbled: false,
    });
    ok(format!("{}\n", id))
}

fn ps(inner: &FakeState, args: &[String]) -> EngineOutput {
    let all = args.iter().any(|a| a == "-a");
    let quiet = args.iter().any(|a| a == "-q");
    let filters: Vec<(&str, &str)> = flag_values(args, "--filter")
        .into_iter()
        .filter_map(|f| f.strip_prefix("label="))
        .filter_map(|f| f.split_once('='))
        .collect();
    let format = flag_values(args, "--format").first().copied();

    let label = |c: &FakeContainer, key: &str| c.labels.get(key).cloned().unwrap_or_default();
    let sep = FIELD_SEPARATOR.to_string();

    let lines: Vec<String> = inner
        .containers
        .iter()
        .filter(|c| all || c.state.running)
        .filter(|c| filters.iter().all(|(k, v)| c.labels.get(*k).map(String::as_str) == Some(*v)))
        .map(|c| {
            if quiet {
                return c.id[..12].to_string();
            }
            match format {
                Some(LIST_FORMAT) => [
                    c.name.clone(),
                    label(c, PROJECT_LABEL),
                    label(c, TRAJECTORY_LABEL),
                    label(c, RAW_PROJECT_LABEL),
                    label(c, RAW_TRAJECTORY_LABEL),
                    c.state.status.clone(),
                    CREATED_AT.to_string(),
                ]
                .join(&sep),
                Some(CANCEL_FORMAT) => {
                    [c.id[..12].to_string(), label(c, RAW_PROJECT_LABEL)].join(&sep)
                }
                _ => c.name.clone(),
            }
        })
        .collect();

    ok(lines.into_iter().map(|l| l + "\n").collect::<String>())
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn run(&self, args: &[String]) -> Result<EngineOutput, EngineError> {
        let delay = *self.delay.lock().unwrap();
        if delay.is_zero() {
            return Ok(self.handle(args));
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        let output = self.handle(args);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(output)
    }
}
