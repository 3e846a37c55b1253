use thiserror::Error;

/// Failure to invoke the container engine at all
/// A non-zero exit is not an error at this level; it comes back as output.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by runner operations
///
/// Only `start_job` returns these. Every other operation logs engine
/// trouble and answers with an absent, empty or negative result.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("invalid job function reference `{reference}`: {reason}")]
    InvalidJobFunction { reference: String, reason: String },

    #[error("instance metadata unavailable for `{trajectory_id}`: {reason}")]
    Instance {
        trajectory_id: String,
        reason: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
