use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reflow_core::{Diagnostic, ModelStatus, RunReport, RunStatus, Severity};
use reflow_engine::{
    run_project_at, CancellationHandle, Compiler, EngineError, MetadataValidator, Project, SchemaDiff, Selection,
};
use reflow_warehouse::{MockWarehouse, PostgresWarehouse, WarehouseAdapter};

/// Environment variable holding the warehouse connection string
const WAREHOUSE_URL_ENV: &str = "REFLOW_WAREHOUSE_URL";

/// Reflow - dependency-graph-driven SQL materializer
#[derive(Parser)]
#[command(name = "reflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project directory containing reflow.toml (default: current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Materialize every enabled model in dependency order
    Run {
        /// Models to run; prefix with + to include upstream models
        #[arg(short, long, num_args = 1..)]
        select: Vec<String>,

        /// Record statements against an in-memory warehouse instead
        #[arg(long)]
        dry_run: bool,

        /// Override run.threads from reflow.toml
        #[arg(short, long)]
        threads: Option<usize>,

        /// Output file for the run report
        #[arg(short, long, default_value = "target/run_results.json")]
        output: PathBuf,
    },

    /// Render every model to SQL without executing anything
    Compile {
        /// Models to compile; prefix with + to include upstream models
        #[arg(short, long, num_args = 1..)]
        select: Vec<String>,

        /// Directory for rendered SQL
        #[arg(short, long, default_value = "target/compiled")]
        output_dir: PathBuf,
    },

    /// Show the execution plan (order and layers)
    Plan {
        /// Models to plan; prefix with + to include upstream models
        #[arg(short, long, num_args = 1..)]
        select: Vec<String>,
    },

    /// Show downstream impact for a model
    Impact {
        /// Model name to analyze
        model: String,
    },

    /// Check model documentation for completeness
    Validate {
        /// Also write a markdown report to this file
        #[arg(long)]
        markdown: Option<PathBuf>,
    },

    /// Compare documented models and columns with a baseline project
    SchemaDiff {
        /// Baseline project directory, such as a checkout of the main branch
        #[arg(short, long)]
        state: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // .env is optional
    let _ = dotenvy::dotenv();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    if cli.verbose {
        eprintln!("{} {}", "Loading project from:".cyan(), cli.project_dir.display());
    }

    let dir = &cli.project_dir;
    match cli.command {
        // Loads the project itself so load failures still produce a report
        Commands::Run { select, dry_run, threads, output } => {
            run_command(dir, &select, dry_run, threads, &output, cli.verbose).await
        }
        Commands::Compile { select, output_dir } => {
            compile_command(&load_or_report(dir)?, &select, &output_dir, cli.verbose)
        }
        Commands::Plan { select } => plan_command(&load_or_report(dir)?, &select),
        Commands::Impact { model } => impact_command(&load_or_report(dir)?, &model),
        Commands::Validate { markdown } => validate_command(&load_or_report(dir)?, markdown.as_deref()),
        Commands::SchemaDiff { state } => schema_diff_command(&load_or_report(dir)?, &state),
    }
}

/// Run command - load, validate, then materialize layer by layer
async fn run_command(
    project_dir: &Path,
    select: &[String],
    dry_run: bool,
    threads: Option<usize>,
    output: &Path,
    verbose: bool,
) -> Result<()> {
    let warehouse = connect_warehouse(dry_run, verbose).await?;

    if verbose {
        eprintln!("{}", "Testing warehouse connection...".cyan());
    }
    warehouse
        .test_connection()
        .await
        .with_context(|| format!("Cannot reach {} warehouse", warehouse.name()))?;

    let cancel = CancellationHandle::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", "Interrupted: finishing in-flight models, skipping the rest".yellow());
            on_interrupt.cancel();
        }
    });

    eprintln!(
        "{} {} on {}",
        "Running".cyan(),
        project_dir.display(),
        warehouse.name()
    );

    let report = run_project_at(project_dir, warehouse, &Selection::parse(select), cancel, threads).await?;
    tracing::info!(status = %report.status, elapsed = report.elapsed_secs, "run finished");

    print_run_summary(&report);

    let output = if output.is_relative() {
        project_dir.join(output)
    } else {
        output.to_path_buf()
    };
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    report.save_to_file(&output)?;
    eprintln!("{} {}", "Report saved to:".green(), output.display());

    if report.status != RunStatus::Success {
        std::process::exit(1);
    }

    Ok(())
}

async fn connect_warehouse(dry_run: bool, verbose: bool) -> Result<Arc<dyn WarehouseAdapter>> {
    if dry_run {
        if verbose {
            eprintln!("{}", "Dry run: statements are recorded, not executed".yellow());
        }
        return Ok(Arc::new(MockWarehouse::new()));
    }

    let url = std::env::var(WAREHOUSE_URL_ENV).map_err(|_| {
        anyhow::anyhow!(
            "{} is not set. Set it (or add it to .env), or use --dry-run",
            WAREHOUSE_URL_ENV
        )
    })?;

    if verbose {
        eprintln!("{}", "Connecting to PostgreSQL...".cyan());
    }

    let warehouse = if url.contains("sslmode=require") {
        PostgresWarehouse::from_connection_string_with_tls(&url).await?
    } else {
        PostgresWarehouse::from_connection_string(&url).await?
    };

    if verbose {
        eprintln!("{} {}", "Connected to".green(), warehouse.connection_info());
    }

    Ok(Arc::new(warehouse))
}

/// Compile command - render SQL for every enabled model
fn compile_command(project: &Project, select: &[String], output_dir: &Path, verbose: bool) -> Result<()> {
    let plan = compile_or_report(project, select)?;

    let output_dir = if output_dir.is_relative() {
        project.config.project_root.join(output_dir)
    } else {
        output_dir.to_path_buf()
    };

    let written = plan.write_compiled(&output_dir)?;

    if verbose {
        for path in &written {
            eprintln!("  {} {}", "Wrote".cyan(), path.display());
        }
    }

    eprintln!(
        "{} {} models to {}",
        "Compiled".green(),
        written.len(),
        output_dir.display()
    );
    Ok(())
}

/// Plan command - show execution order and layers
fn plan_command(project: &Project, select: &[String]) -> Result<()> {
    let plan = compile_or_report(project, select)?;

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Execution Plan".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();
    println!("{} {}", "Models:".bold(), plan.len());
    println!("{} {}", "Layers:".bold(), plan.layers().len());

    for (index, layer) in plan.layers().iter().enumerate() {
        println!();
        println!("{}", format!("Layer {}", index).bold());
        for name in layer {
            let Some(model) = plan.model(name) else {
                continue;
            };
            let line = format!("{} -> {} ({})", model.name, model.relation, model.materialization);
            if model.enabled {
                println!("  {}", line.green());
            } else {
                println!("  {} {}", line.dimmed(), "[disabled]".yellow());
            }
        }
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());
    Ok(())
}

/// Impact command - show downstream dependencies
fn impact_command(project: &Project, model: &str) -> Result<()> {
    let plan = compile_or_report(project, &[])?;
    let graph = plan.graph();

    if !graph.contains(model) {
        return Err(anyhow::anyhow!("Model '{}' not found in project", model));
    }

    let downstream = graph.downstream(model);

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Downstream Impact Analysis".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();
    println!("{} {}", "Model:".bold(), model.green());
    println!("{} {}", "Downstream models:".bold(), downstream.len());
    println!();

    if downstream.is_empty() {
        println!("{}", "✓ No downstream dependencies".green());
        println!("A failure of this model blocks nothing else.");
    } else {
        println!("{}", "Blocked if this model fails (in execution order):".bold());
        println!();
        let affected = plan.order().iter().filter(|n| downstream.contains(n));
        for (i, name) in affected.enumerate() {
            let relation = plan
                .model(name)
                .map(|m| m.relation.to_string())
                .unwrap_or_default();
            println!("  {}. {} ({})", i + 1, name.yellow(), relation);
        }
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());
    Ok(())
}

/// Validate command - documentation completeness
fn validate_command(project: &Project, markdown: Option<&Path>) -> Result<()> {
    let docs = project.docs().map_err(|e| {
        print_diagnostics(&e.diagnostics());
        anyhow::anyhow!("{}", e)
    })?;
    let report = MetadataValidator::new(project, &docs).validate();

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Validation Report".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    if report.diagnostics.is_empty() {
        println!("{}", "✓ All validation checks passed".green());
    } else {
        print_diagnostics(&report.diagnostics);
    }

    if let Some(md_path) = markdown {
        if let Some(parent) = md_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(md_path, report.to_markdown())
            .with_context(|| format!("Failed to write {}", md_path.display()))?;
        eprintln!("{} {}", "Markdown report saved to:".green(), md_path.display());
    }

    if !report.is_success() {
        eprintln!(
            "{} {} error(s)",
            "Validation failed:".red().bold(),
            report.errors().count()
        );
        std::process::exit(1);
    }

    Ok(())
}

/// Schema-diff command - documented changes against a baseline, never fails
fn schema_diff_command(project: &Project, state: &Path) -> Result<()> {
    let baseline = load_or_report(state)?
        .docs()
        .with_context(|| format!("Failed to read documentation in {}", state.display()))?;
    let current = project.docs().context("Failed to read documentation")?;
    let diff = SchemaDiff::compare(&baseline, &current);
    let plan = compile_or_report(project, &[])?;

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Schema Change Report".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    if diff.changes.is_empty() {
        println!("{}", "No schema changes detected".cyan());
    }

    let breaking: Vec<_> = diff.breaking().collect();
    if !breaking.is_empty() {
        println!("{} ({})", "BREAKING CHANGES".red().bold(), breaking.len());
        for diag in diff.to_diagnostics(plan.graph()).iter().filter(|d| d.severity == Severity::Warn) {
            println!("  {}", diag.message.red());
            if !diag.impact.is_empty() {
                println!("      downstream: {}", diag.impact.join(", ").yellow());
            }
        }
        println!();
        println!("Update downstream models and notify consumers before merging.");
    }

    let additions: Vec<_> = diff.non_breaking().collect();
    if !additions.is_empty() {
        println!();
        println!("{} ({})", "NON-BREAKING CHANGES".green().bold(), additions.len());
        for change in additions {
            println!("  {}", change.to_string().green());
        }
    }

    Ok(())
}

fn load_or_report(project_dir: &Path) -> Result<Project> {
    Project::load(project_dir).map_err(|e| {
        print_diagnostics(&e.diagnostics());
        anyhow::anyhow!("Failed to load project: {}", e)
    })
}

fn compile_or_report(project: &Project, select: &[String]) -> Result<reflow_engine::ExecutionPlan> {
    Compiler::new(project)
        .compile_selection(&Selection::parse(select))
        .map_err(|e: EngineError| {
            print_diagnostics(&e.diagnostics());
            anyhow::anyhow!("{}", e)
        })
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    for diag in diagnostics {
        let label = match diag.severity {
            Severity::Error => "error".red().bold(),
            Severity::Warn => "warn".yellow().bold(),
            Severity::Info => "info".cyan(),
        };
        eprintln!("{} {}", label, diag);
    }
}

fn print_run_summary(report: &RunReport) {
    eprintln!();
    for result in &report.results {
        let marker = match result.status {
            ModelStatus::Succeeded => "✓".green(),
            ModelStatus::SucceededWithWarning => "⚠".yellow(),
            ModelStatus::Failed => "✗".red(),
            ModelStatus::Blocked => "⊘".red(),
            ModelStatus::Skipped => "-".dimmed(),
            _ => "·".dimmed(),
        };
        eprintln!(
            "  {} {} ({}) [{}ms] {}",
            marker,
            result.model,
            result.relation,
            (result.duration_secs * 1000.0) as u64,
            result.status
        );
        if let Some(error) = &result.error {
            eprintln!("      {}", error.red());
        }
        for warning in &result.warnings {
            eprintln!("      {}", warning.yellow());
        }
    }

    if report.status == RunStatus::FailedValidation {
        print_diagnostics(&report.diagnostics);
    }

    let s = &report.summary;
    eprintln!();
    eprintln!(
        "{} {} total, {} succeeded, {} warned, {} failed, {} blocked, {} skipped, {} cancelled",
        "Summary:".bold(),
        s.total,
        s.succeeded.to_string().green(),
        s.warned.to_string().yellow(),
        s.failed.to_string().red(),
        s.blocked.to_string().red(),
        s.skipped,
        s.cancelled
    );

    let status = match report.status {
        RunStatus::Success => "success".green().bold(),
        RunStatus::PartialFailure => "partial_failure".red().bold(),
        RunStatus::FailedValidation => "failed_validation".red().bold(),
    };
    eprintln!("{} {}", "Status:".bold(), status);
}
