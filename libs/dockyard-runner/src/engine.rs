/// Container Engine - Abstraction for invoking the external engine
///
/// **Core Responsibility:**
/// Run one engine command and capture its raw output.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to reach the container runtime (CLI, socket, remote)
/// - Engine does NOT interpret output or map states
/// - Engine does NOT decide what a non-zero exit means
/// - Engine returns raw output for the runner to judge
///
/// **Why This Exists:**
/// Keeps the runner's lifecycle logic testable without a live daemon.
/// DockerCli in production, an in-memory fake in tests.
use crate::error::EngineError;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Raw result of one engine invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl EngineOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The engine reported that the named resource does not exist
    pub fn is_not_found(&self) -> bool {
        let stderr = self.stderr.to_ascii_lowercase();
        !self.success() && (stderr.contains("no such object") || stderr.contains("no such container"))
    }

    /// stdout followed by stderr, for logs and diagnostics
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}{}", self.stdout, self.stderr),
        }
    }
}

/// Container engine trait
///
/// Any implementation must guarantee:
/// 1. Arguments are passed as a vector, never through a shell
/// 2. stdout, stderr and the exit code are captured in full
/// 3. Only a failure to invoke the engine is an `Err`
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn run(&self, args: &[String]) -> Result<EngineOutput, EngineError>;
}

/// Engine backed by the docker command line client
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(dockyard_common::config::DEFAULT_DOCKER_BINARY)
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn run(&self, args: &[String]) -> Result<EngineOutput, EngineError> {
        debug!(binary = %self.binary, args = ?args, "invoking container engine");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| EngineError::Spawn {
                command: format!("{} {}", self.binary, args.first().map(String::as_str).unwrap_or("")),
                source,
            })?;

        let result = EngineOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // Killed by a signal
            exit_code: output.status.code().unwrap_or(-1),
        };

        if !result.success() {
            warn!(
                binary = %self.binary,
                subcommand = args.first().map(String::as_str).unwrap_or(""),
                exit_code = result.exit_code,
                stderr = %result.stderr.trim(),
                "container engine command failed"
            );
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        let output = EngineOutput {
            stdout: String::new(),
            stderr: "Error: No such object: dockyard-p-t\n".to_string(),
            exit_code: 1,
        };
        assert!(output.is_not_found());

        let output = EngineOutput {
            stderr: "Error response from daemon: No such container: abc".to_string(),
            exit_code: 1,
            ..Default::default()
        };
        assert!(output.is_not_found());

        let output = EngineOutput {
            stderr: "Cannot connect to the Docker daemon".to_string(),
            exit_code: 1,
            ..Default::default()
        };
        assert!(!output.is_not_found());
    }

    #[test]
    fn test_combined_output() {
        let output = EngineOutput {
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
            exit_code: 0,
        };
        assert_eq!(output.combined(), "out\nerr\n");

        let output = EngineOutput {
            stderr: "only err".to_string(),
            ..Default::default()
        };
        assert_eq!(output.combined(), "only err");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let engine = DockerCli::new("/nonexistent/dockyard-docker-binary");
        let err = engine.run(&["info".to_string()]).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
        assert!(err.to_string().contains("info"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_exit_code_and_streams() {
        // `sh` stands in for the engine binary
        let engine = DockerCli::new("sh");
        let args = vec![
            "-c".to_string(),
            "echo out; echo err >&2; exit 3".to_string(),
        ];
        let output = engine.run(&args).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }
}
