pub mod details;
pub mod docker;
pub mod engine;
pub mod error;
pub mod instance;
pub mod job;
pub mod lock;
pub mod provision;
pub mod reaper;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types for convenience
pub use docker::DockerRunner;
pub use engine::{ContainerEngine, DockerCli, EngineOutput};
pub use error::{EngineError, Result, RunnerError};
pub use instance::{InstanceMetadata, InstanceResolver, JsonInstanceResolver, StaticInstanceResolver};
pub use job::{JobArgs, JobDescriptor, JobFunction};
pub use lock::{LocalStartLock, NoopStartLock, StartGuard, StartLock};
pub use provision::{EnvSource, ProcessEnv, StaticEnv};
pub use reaper::{ReapPolicy, ReapReport, Reaper};
pub use runner::{Runner, StartJobRequest};
