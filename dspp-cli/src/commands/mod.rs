//! CLI command implementations

pub mod approve;

use anyhow::{Context, Result};
use colored::Colorize;
use dspp_core::reconcile::RemoteTask;
use dspp_core::{Compiler, DsppError, PlanStatus, Reconciler, SliceFilter};
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::io::Write;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};

pub use approve::DiffApprover;

/// Run `work` behind a spinner on stderr.
pub async fn with_spinner<T>(
    message: &str,
    enabled: bool,
    work: impl Future<Output = dspp_core::Result<T>>,
) -> dspp_core::Result<T> {
    if !enabled {
        return work.await;
    }
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = work.await;
    spinner.finish_and_clear();
    result
}

/// `dspp plan`
pub async fn plan(reconciler: &mut Reconciler, filter: &SliceFilter, commit: bool) -> Result<PlanStatus> {
    let plan = reconciler
        .plan(filter, &DiffApprover::new(commit))
        .await
        .context("Failed to plan stack")?;

    for orphan in &plan.orphan_tasks {
        eprintln!("{} orphan task {}", "•".dimmed(), orphan.yellow());
    }

    match plan.status {
        PlanStatus::NoChange => eprintln!("{} No changes detected (@{})", "✓".green().bold(), plan.stack_revision),
        PlanStatus::Approved => eprintln!("{} Approved @{}", "✓".green().bold(), plan.stack_revision.bold()),
        PlanStatus::PendingApproval => eprintln!("{} Not approved", "✗".red().bold()),
    }
    Ok(plan.status)
}

/// `dspp apply`: plan, then deploy what was approved.
pub async fn apply(
    reconciler: &mut Reconciler,
    filter: &SliceFilter,
    commit: bool,
    force_config: bool,
) -> Result<()> {
    if plan(reconciler, filter, commit).await? == PlanStatus::PendingApproval {
        return Ok(());
    }

    let report = match reconciler.apply(filter, force_config).await {
        Err(e @ DsppError::StaleApproval) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            return Err(e.into());
        }
        other => other.context("Failed to apply stack")?,
    };

    if !report.deployed {
        return Ok(());
    }
    println!("{} Stack deployed: @{}", "✓".green().bold(), report.stack_revision.bold());
    if report.externalized > 0 {
        println!("  {} {} existing config(s) reused", "•".dimmed(), report.externalized);
    }
    for task in &report.pruned_tasks {
        println!("  {} pruned orphan task {}", "•".dimmed(), task);
    }
    println!("  {} state written for {} entities", "•".dimmed(), report.states_written);
    Ok(())
}

/// `dspp parse`
pub async fn parse(compiler: &Compiler, filter: &SliceFilter, progress: bool) -> Result<()> {
    let compiled = with_spinner("Compiling stack", progress, compiler.parse(filter)).await?;
    print!("{}", compiled);
    Ok(())
}

/// `dspp config <name>`
pub async fn config(compiler: &Compiler, name: &str, progress: bool) -> Result<()> {
    let content = with_spinner("Compiling stack", progress, compiler.config_content(name))
        .await?
        .with_context(|| format!("No config named '{}' in stack", name))?;
    std::io::stdout().write_all(&content)?;
    Ok(())
}

/// `dspp update <path> <value>`
pub fn update(compiler: &Compiler, path: &str, value: &str) -> Result<()> {
    let touched = compiler.sources().update(path, value)?;
    for file in touched {
        println!("{} {} updated in {}", "✓".green().bold(), path.bold(), file.display());
    }
    Ok(())
}

/// `dspp config-prune`
pub async fn config_prune(reconciler: &Reconciler, progress: bool) -> Result<()> {
    let pruned = with_spinner("Pruning configs", progress, reconciler.config_prune()).await?;
    if pruned.is_empty() {
        println!("No unused configs");
    }
    for name in pruned {
        println!("{} pruned {}", "✓".green().bold(), name);
    }
    Ok(())
}

#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "TASK")]
    name: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "CONFIG ID")]
    id: String,
}

impl From<RemoteTask> for TaskRow {
    fn from(task: RemoteTask) -> Self {
        Self {
            name: task.name,
            image: task.image.unwrap_or_else(|| "-".to_string()),
            id: task.id.chars().take(12).collect(),
        }
    }
}

/// `dspp tasks`
pub async fn tasks(reconciler: &Reconciler) -> Result<()> {
    let tasks = reconciler.tasks().await.context("Failed to list tasks")?;
    if tasks.is_empty() {
        println!("No tasks deployed");
        return Ok(());
    }

    let rows: Vec<TaskRow> = tasks.into_values().map(TaskRow::from).collect();
    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);
    Ok(())
}

/// `dspp version`
pub async fn version(reconciler: &Reconciler) -> Result<()> {
    println!("dspp v{}", dspp_core::DSPP_VERSION);
    let remote = reconciler.version().await.context("Failed to reach the control plane")?;
    println!("{}", serde_json::to_string_pretty(&remote)?);
    Ok(())
}
