pub mod config;
pub mod identity;
pub mod status;
pub mod types;

// Re-export commonly used types for convenience
pub use config::{EnvSnapshot, RunnerConfig, RunnerSettings};
pub use status::{map_container_state, RawContainerState};
pub use types::{
    JobDetailSection, JobDetails, JobInfo, JobStatus, JobsStatusSummary, RunnerInfo, RunnerStatus,
};
