//! drfc - DeepRacer training stack orchestrator
//!
//! Thin CLI over the orchestration facade.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use drfc_orchestrator::{BackendStyle, Orchestrator, OrchestratorSettings, RunConfiguration};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// drfc - run DeepRacer training stacks on Docker Compose or Swarm
#[derive(Parser)]
#[command(name = "drfc")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Start, stop and inspect DeepRacer training stacks", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Orchestrator settings file (YAML)
    #[arg(long, global = true, env = "DRFC_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run and wait until every service is running
    Start {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Stop a run and clean up after it
    Stop {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Show service status
    Status {
        #[command(flatten)]
        run: RunArgs,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Fetch logs of one service
    Logs {
        #[command(flatten)]
        run: RunArgs,
        /// Service name (e.g. robomaker)
        service: String,
        /// Number of lines to show from the end
        #[arg(short = 'n', long, default_value = "100")]
        tail: u32,
    },

    /// Print the merged configuration without running anything
    Render {
        #[command(flatten)]
        run: RunArgs,
    },
}

/// Description of the run a command acts on
#[derive(Args)]
struct RunArgs {
    /// Backend style (compose or swarm)
    #[arg(long, env = "DR_DOCKER_STYLE", default_value = "compose")]
    style: BackendStyle,

    /// Run identifier
    #[arg(long, env = "DR_RUN_ID", default_value = "0")]
    run_id: u32,

    /// Number of worker replicas
    #[arg(short, long, env = "DR_WORKERS", default_value = "1")]
    workers: u32,

    /// AWS region passed to the containers
    #[arg(long, env = "DR_AWS_APP_REGION")]
    region: Option<String>,

    /// Project name (defaults to deepracer-<run-id>)
    #[arg(short, long, env = "DR_PROJECT_NAME")]
    project: Option<String>,

    /// Base compose file; repeat to layer, later files win
    #[arg(short = 'f', long = "file", env = "DR_COMPOSE_FILES", value_delimiter = ',')]
    files: Vec<PathBuf>,

    /// Redis endpoint injected into the coordinator (host[:port])
    #[arg(long, env = "DR_REDIS_ENDPOINT")]
    redis: Option<String>,

    /// Environment override (KEY=VALUE)
    #[arg(short, long = "env")]
    env: Vec<String>,
}

impl RunArgs {
    fn into_config(self) -> Result<RunConfiguration> {
        let mut builder = RunConfiguration::builder(self.run_id)
            .style(self.style)
            .workers(self.workers);

        if let Some(region) = self.region {
            builder = builder.region(region);
        }
        if let Some(project) = self.project {
            builder = builder.project_name(project);
        }
        if let Some(redis) = self.redis {
            builder = builder.redis_endpoint(redis);
        }
        for file in self.files {
            builder = builder.base_config(file);
        }
        for pair in self.env {
            let Some((key, value)) = pair.split_once('=') else {
                bail!("Invalid environment override '{}': expected KEY=VALUE", pair);
            };
            builder = builder.env(key, value);
        }

        Ok(builder.build()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = match cli.settings {
        Some(ref path) => OrchestratorSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => OrchestratorSettings::default(),
    };
    let orchestrator = Orchestrator::new(settings);

    match cli.command {
        Commands::Start { run } => {
            let config = run.into_config()?;

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, cancelling start");
                    interrupt.cancel();
                }
            });

            let snapshot = orchestrator.start_with_cancel(&config, cancel).await?;
            println!("Project {} is running", config.project_name());
            print!("{}", snapshot);
        }

        Commands::Stop { run } => {
            let config = run.into_config()?;
            let report = orchestrator.stop(&config).await?;
            for err in &report.errors {
                eprintln!("warning: {}", err.message);
            }
            println!("Project {} stopped", config.project_name());
        }

        Commands::Status { run, json } => {
            let config = run.into_config()?;
            let snapshot = orchestrator.status(&config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{}", snapshot);
            }
        }

        Commands::Logs { run, service, tail } => {
            let config = run.into_config()?;
            print!("{}", orchestrator.logs(&config, &service, tail).await?);
        }

        Commands::Render { run } => {
            let config = run.into_config()?;
            print!("{}", orchestrator.render_yaml(&config)?);
        }
    }

    Ok(())
}
