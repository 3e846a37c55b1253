mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dockyard")]
#[command(about = "Dockyard - Run agent jobs in isolated Docker containers", long_about = None)]
struct Cli {
    /// Directory holding `{trajectory_id}.json` instance files
    #[arg(long, global = true, default_value = "instances")]
    instances_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a job unless one is already active for the same key
    Start {
        #[arg(short, long)]
        project: String,

        #[arg(short, long)]
        trajectory: String,

        /// Job function reference (e.g., agents.jobs.run_trajectory)
        #[arg(short, long)]
        func: String,

        /// Node to resume from
        #[arg(short, long)]
        node: Option<u64>,

        /// Image override
        #[arg(short, long)]
        image: Option<String>,

        /// Memory limit (e.g., 4g)
        #[arg(short, long)]
        memory: Option<String>,

        /// Memory + swap limit (defaults to the memory limit)
        #[arg(long)]
        memory_swap: Option<String>,
    },

    /// Show the status of one job
    Status {
        #[arg(short, long)]
        project: String,

        #[arg(short, long)]
        trajectory: String,
    },

    /// List managed jobs
    List {
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Count jobs per status
    Summary {
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Cancel one job, or every job of a project
    Cancel {
        #[arg(short, long)]
        project: String,

        /// Omit to cancel the whole project
        #[arg(short, long)]
        trajectory: Option<String>,
    },

    /// Remove a job's container
    Cleanup {
        #[arg(short, long)]
        project: String,

        #[arg(short, long)]
        trajectory: String,
    },

    /// Print a job's combined output
    Logs {
        #[arg(short, long)]
        project: String,

        #[arg(short, long)]
        trajectory: String,
    },

    /// Print structured job details as JSON
    Details {
        #[arg(short, long)]
        project: String,

        #[arg(short, long)]
        trajectory: String,
    },

    /// Show container engine health
    Info,

    /// Remove expired and timed-out jobs
    Reap {
        #[arg(short, long)]
        project: Option<String>,

        /// Run a single pass and exit
        #[arg(long)]
        once: bool,

        /// Seconds between passes
        #[arg(long, default_value = "60")]
        interval_secs: u64,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("DOCKYARD_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Logs go to stderr so command output stays machine-readable
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let runner = commands::build_runner(&cli.instances_dir);

    match cli.command {
        Commands::Start {
            project,
            trajectory,
            func,
            node,
            image,
            memory,
            memory_swap,
        } => {
            commands::start_job(
                &runner,
                &project,
                &trajectory,
                &func,
                node,
                image,
                memory,
                memory_swap,
            )
            .await?;
        }
        Commands::Status { project, trajectory } => {
            commands::show_status(&runner, &project, &trajectory).await?;
        }
        Commands::List { project } => {
            commands::list_jobs(&runner, project.as_deref()).await?;
        }
        Commands::Summary { project } => {
            commands::show_summary(&runner, project.as_deref()).await?;
        }
        Commands::Cancel { project, trajectory } => {
            commands::cancel_jobs(&runner, &project, trajectory.as_deref()).await?;
        }
        Commands::Cleanup { project, trajectory } => {
            commands::cleanup_job(&runner, &project, &trajectory).await?;
        }
        Commands::Logs { project, trajectory } => {
            commands::show_logs(&runner, &project, &trajectory).await?;
        }
        Commands::Details { project, trajectory } => {
            commands::show_details(&runner, &project, &trajectory).await?;
        }
        Commands::Info => {
            commands::show_info(&runner).await?;
        }
        Commands::Reap {
            project,
            once,
            interval_secs,
        } => {
            commands::reap(runner, project.as_deref(), once, interval_secs).await?;
        }
    }

    Ok(())
}
