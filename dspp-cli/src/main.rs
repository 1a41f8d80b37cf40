use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dspp_core::{Compiler, Config, Reconciler, SliceFilter};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod client;
mod commands;

#[derive(Parser)]
#[command(name = "dspp")]
#[command(about = "Compile compose fragments into a swarm stack and reconcile it", long_about = None)]
#[command(version)]
struct Cli {
    /// Stack entry file
    #[arg(short, long, global = true, default_value = "stack.yml")]
    file: PathBuf,

    /// Template value for `${ctx.KEY}` (KEY=VALUE)
    #[arg(short = 'D', long = "define", global = true)]
    define: Vec<String>,

    /// Disable progress spinners
    #[arg(long, global = true)]
    no_progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the change between the running stack and the compiled one
    Plan {
        /// Only services/tasks whose name matches this regex
        #[arg(long)]
        filter: Option<String>,

        /// Approve without asking
        #[arg(long)]
        commit: bool,

        /// Only tasks
        #[arg(long)]
        tasks: bool,
    },

    /// Plan, then deploy the approved stack
    Apply {
        #[arg(long)]
        filter: Option<String>,

        #[arg(long)]
        commit: bool,

        #[arg(long)]
        tasks: bool,

        /// Redeploy configs that already exist remotely
        #[arg(long)]
        force_config: bool,
    },

    /// Print the compiled stack
    Parse {
        #[arg(long)]
        filter: Option<String>,

        #[arg(long)]
        tasks: bool,
    },

    /// Delete remote configs the stack no longer uses
    ConfigPrune,

    /// Set a scalar in every fragment that defines it
    Update {
        /// Dotted path (e.g. services.web.image)
        path: String,

        value: String,
    },

    /// Print the resolved content of one config
    Config {
        /// Logical config name
        name: String,
    },

    /// List deployed tasks
    Tasks,

    /// Show dspp and control plane versions
    Version,
}

fn parse_defines(defines: &[String]) -> Result<BTreeMap<String, String>> {
    defines
        .iter()
        .map(|d| {
            let (key, value) = d
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("Invalid define format: {}", d))?;
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Project root and entry file (relative to the root) from `--file`.
fn project_layout(file: &Path) -> Result<(PathBuf, PathBuf)> {
    let cwd = std::env::current_dir().context("Cannot read current directory")?;
    let full = if file.is_absolute() { file.to_path_buf() } else { cwd.join(file) };
    let root = full.parent().map(Path::to_path_buf).unwrap_or(cwd);
    let entry = full.file_name().map(PathBuf::from).context("Stack file has no name")?;
    Ok((root, entry))
}

fn filter_of(filter: Option<String>, tasks: bool) -> SliceFilter {
    SliceFilter::new(filter.as_deref()).tasks_only(tasks)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (root, entry) = project_layout(&cli.file)?;
    let config = Config::load(&root)?;
    if let Err(e) = dspp_core::init_observability(&config.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let compiler = Compiler::new(&root, &entry, config.clone())
        .with_context(|| format!("Failed to load stack {}", cli.file.display()))?
        .with_defines(parse_defines(&cli.define)?);
    let progress = !cli.no_progress;

    match cli.command {
        Commands::Parse { filter, tasks } => {
            commands::parse(&compiler, &filter_of(filter, tasks), progress).await?;
        }

        Commands::Update { path, value } => {
            commands::update(&compiler, &path, &value)?;
        }

        Commands::Config { name } => {
            commands::config(&compiler, &name, progress).await?;
        }

        command => {
            let remote = Arc::new(client::DockerClient::new(&config)?);
            let mut reconciler = Reconciler::new(compiler, remote);

            match command {
                Commands::Plan { filter, commit, tasks } => {
                    commands::plan(&mut reconciler, &filter_of(filter, tasks), commit).await?;
                }
                Commands::Apply { filter, commit, tasks, force_config } => {
                    let filter = filter_of(filter, tasks);
                    commands::apply(&mut reconciler, &filter, commit, force_config).await?;
                }
                Commands::ConfigPrune => commands::config_prune(&reconciler, progress).await?,
                Commands::Tasks => commands::tasks(&reconciler).await?,
                Commands::Version => commands::version(&reconciler).await?,
                Commands::Parse { .. } | Commands::Update { .. } | Commands::Config { .. } => {}
            }
        }
    }

    Ok(())
}
