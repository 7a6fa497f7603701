use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

use dbtflow::app::{self, AppConfig};
use dbtflow::config::{PipelineConfig, RunPolicy};
use dbtflow::pipeline::{cancel_pair, Pipeline, PipelinePaths, RunReport, StageState};
use dbtflow::resolver::{ResolvedEnvironment, MASK};
use dbtflow::subprocess::SubprocessManager;

/// Resolve Snowflake settings from a connection record and run dbt
#[derive(Parser)]
#[command(name = "dbtflow")]
#[command(about = "Run the dbt pipeline against a stored Snowflake connection", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run start → dbt_debug → dbt_deps → dbt_run → dbt_test → end
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// What to do when another run is active: reject or queue
        #[arg(long)]
        policy: Option<RunPolicy>,

        /// Print the run report as JSON on stdout
        #[arg(long)]
        json: bool,
    },
    /// Show the environment a run would use
    Env {
        #[command(flatten)]
        overrides: Overrides,

        /// Print as JSON
        #[arg(long)]
        json: bool,

        /// Print secret values instead of masking them
        #[arg(long)]
        show_secrets: bool,
    },
    /// List the pipeline stages and the commands each one runs
    Stages {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Flags that take precedence over the config file and `DBTFLOW_*` variables
#[derive(Args, Default)]
struct Overrides {
    /// Name of the connection record
    #[arg(long)]
    connection: Option<String>,

    /// YAML or JSON file with connection records
    #[arg(long)]
    connections_file: Option<PathBuf>,

    /// dbt project directory
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Directory holding profiles.yml
    #[arg(long)]
    profiles_dir: Option<PathBuf>,

    /// dbt target
    #[arg(short = 't', long)]
    target: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(connection) = self.connection {
            config.connection_id = connection;
        }
        if let Some(path) = self.connections_file {
            config.connections_file = Some(path);
        }
        if let Some(dir) = self.project_dir {
            config.project_dir = dir;
        }
        if let Some(dir) = self.profiles_dir {
            config.profiles_dir = dir;
        }
        if let Some(target) = self.target {
            config.target = target;
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let app_config = AppConfig::new(cli.verbose);
    app::init_logging(&app_config);

    let result = match cli.command {
        Commands::Run {
            overrides,
            policy,
            json,
        } => run_command(cli.config, overrides, policy, json).await,
        Commands::Env {
            overrides,
            json,
            show_secrets,
        } => env_command(cli.config, overrides, json, show_secrets),
        Commands::Stages { overrides } => stages_command(cli.config, overrides),
    };

    if let Err(e) = result {
        app::handle_fatal_error(e, cli.verbose);
    }
}

fn load_config(path: Option<PathBuf>, overrides: Overrides) -> anyhow::Result<PipelineConfig> {
    let mut config =
        PipelineConfig::load(path.as_deref()).context("Failed to load configuration")?;
    overrides.apply(&mut config);
    config.validate()?;
    debug!("Effective configuration: {:?}", config);
    Ok(config)
}

async fn run_command(
    config_path: Option<PathBuf>,
    overrides: Overrides,
    policy: Option<RunPolicy>,
    json: bool,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path, overrides)?;
    if let Some(policy) = policy {
        config.run_policy = policy;
    }
    let store = app::default_store(&config)?;

    let (handle, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling the run");
            handle.cancel();
        }
    });

    let report = app::run_pipeline(&config, &store, SubprocessManager::production(), token).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }

    match report.failure() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn print_summary(report: &RunReport) {
    println!("Run {} ({})", report.run_id, report.pipeline);
    for stage in &report.stages {
        let marker = match stage.state {
            StageState::Succeeded => "ok",
            StageState::Failed => "FAILED",
            StageState::Skipped => "skipped",
            StageState::Pending | StageState::Running => "?",
        };
        println!("  {:<10} {}", stage.name, marker);
    }
}

#[derive(Serialize)]
struct EnvEntry<'a> {
    value: &'a str,
    source: String,
    secret: bool,
}

fn env_command(
    config_path: Option<PathBuf>,
    overrides: Overrides,
    json: bool,
    show_secrets: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path, overrides)?;
    let store = app::default_store(&config)?;
    let env = app::resolve_environment(&config, &store)?;

    let entries = env_entries(&env, show_secrets);
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for (name, entry) in &entries {
            println!("{}={}  # {}", name, entry.value, entry.source);
        }
    }
    Ok(())
}

fn env_entries(env: &ResolvedEnvironment, show_secrets: bool) -> BTreeMap<&str, EnvEntry<'_>> {
    env.overlay()
        .iter()
        .map(|(name, value)| {
            let secret = env.is_secret(name);
            let value = if secret && !show_secrets {
                MASK
            } else {
                value.as_str()
            };
            let source = env
                .source(name)
                .map(|source| source.to_string())
                .unwrap_or_default();
            (
                name.as_str(),
                EnvEntry {
                    value,
                    source,
                    secret,
                },
            )
        })
        .collect()
}

fn stages_command(config_path: Option<PathBuf>, overrides: Overrides) -> anyhow::Result<()> {
    let config = load_config(config_path, overrides)?;
    let pipeline = Pipeline::dbt(&config)?;
    let paths = PipelinePaths::from_config(&config)?;

    println!("{}", pipeline.name());
    for stage in pipeline.stages() {
        println!("  {}", stage.name);
        for command in &stage.commands {
            println!("    $ {}", command.render(&paths, None).display_line());
        }
    }
    Ok(())
}
