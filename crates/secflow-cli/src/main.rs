use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use secflow_core::config::{CONFIG_PATH_ENV, OrchestratorConfig};
use secflow_core::execution::TokioProcessExecutor;
use secflow_core::models::{
    ExportedFinding, TaskRecord, WorkflowId, WorkflowRecord, WorkflowStatus, WorkflowStatusReport,
};
use secflow_core::orchestration::{DependencyGraph, Orchestrator};
use secflow_core::registry::AdapterRegistry;
use secflow_core::sqlite::SqliteStore;
use secflow_core::templates::{TemplateLibrary, TemplateOverrides};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "secflow")]
#[command(about = "Security tool workflow orchestrator", version)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(long, global = true, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered tool adapters and whether each is functional
    Adapters,
    /// List available workflow templates
    Templates,
    /// Show the execution phases a template would produce for a target
    Plan {
        template: String,
        target: String,
        /// Option override as task_key.option=value (value parsed as JSON, else text)
        #[arg(long = "set", value_name = "KEY.OPTION=VALUE")]
        overrides: Vec<String>,
    },
    /// Instantiate a template, run it to completion and print the results
    Run {
        template: String,
        target: String,
        #[arg(long = "set", value_name = "KEY.OPTION=VALUE")]
        overrides: Vec<String>,
        /// Print the report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show the status of a persisted workflow
    Status {
        workflow_id: u64,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the findings of a persisted workflow
    Findings {
        workflow_id: u64,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Serialize)]
struct RunReport<'a> {
    report: &'a WorkflowStatusReport,
    findings: &'a [ExportedFinding],
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = OrchestratorConfig::resolve(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Commands::Adapters => {
            let registry = AdapterRegistry::builtin(&config, Arc::new(TokioProcessExecutor))?;
            for descriptor in registry.descriptors() {
                let availability = if descriptor.functional {
                    "available"
                } else {
                    "unavailable"
                };
                println!(
                    "{:<8} {:<24} {:<18} {availability}",
                    descriptor.name,
                    descriptor.display_name,
                    descriptor.category.as_str()
                );
            }
        }
        Commands::Templates => {
            let templates = load_templates(&config)?;
            for summary in templates.summaries() {
                println!("{} ({} tasks)", summary.name, summary.task_count);
                println!("    {}", summary.description);
                println!("    adapters: {}", summary.adapters.join(", "));
            }
        }
        Commands::Plan {
            template,
            target,
            overrides,
        } => {
            let templates = load_templates(&config)?;
            let overrides = parse_overrides(&overrides)?;
            print_plan(&templates, &template, &target, &overrides)?;
        }
        Commands::Run {
            template,
            target,
            overrides,
            json,
        } => {
            let overrides = parse_overrides(&overrides)?;
            let orchestrator = build_orchestrator(config).await?;
            let workflow_id = orchestrator
                .instantiate_template(&template, &target, &overrides)
                .await?;
            orchestrator.execute(workflow_id).await?;
            info!(workflow_id = %workflow_id, "workflow started");

            let record = tokio::select! {
                finished = orchestrator.wait_for_terminal(workflow_id, None) => finished?,
                interrupt = tokio::signal::ctrl_c() => {
                    interrupt.context("failed to listen for ctrl-c")?;
                    info!(workflow_id = %workflow_id, "interrupt received, cancelling workflow");
                    orchestrator.cancel(workflow_id).await?;
                    orchestrator.wait_for_terminal(workflow_id, None).await?
                }
            };

            let findings = orchestrator.findings(workflow_id)?;
            print_run(&record, &findings, json)?;
            return Ok(exit_code(record.status));
        }
        Commands::Status { workflow_id, json } => {
            let orchestrator = open_read_only_orchestrator(config).await?;
            let record = orchestrator.snapshot(WorkflowId(workflow_id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record.status_report())?);
            } else {
                print_record(&record);
            }
        }
        Commands::Findings { workflow_id, json } => {
            let orchestrator = open_read_only_orchestrator(config).await?;
            let findings = orchestrator.findings(WorkflowId(workflow_id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&findings)?);
            } else {
                print_findings(&findings);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn load_templates(config: &OrchestratorConfig) -> Result<TemplateLibrary> {
    let mut templates = TemplateLibrary::builtin();
    if let Some(path) = &config.templates_path {
        let loaded = templates.load_json_file(path)?;
        info!(path = %path.display(), templates = loaded, "loaded workflow templates");
    }
    Ok(templates)
}

async fn build_orchestrator(config: OrchestratorConfig) -> Result<Orchestrator> {
    let registry = AdapterRegistry::builtin(&config, Arc::new(TokioProcessExecutor))?;
    let templates = load_templates(&config)?;

    let orchestrator = match config.database_path.clone() {
        Some(path) => {
            let store = open_store(path).await?;
            Orchestrator::with_store(registry, config, store).await?
        }
        None => Orchestrator::with_config(registry, config),
    };
    Ok(orchestrator.with_templates(templates))
}

async fn open_read_only_orchestrator(config: OrchestratorConfig) -> Result<Orchestrator> {
    let Some(path) = config.database_path.clone() else {
        bail!("no database_path configured; workflows are only kept for the life of `run`");
    };
    let registry = AdapterRegistry::builtin(&config, Arc::new(TokioProcessExecutor))?;
    let store = open_store(path).await?;
    Ok(Orchestrator::open_read_only(registry, config, store).await?)
}

async fn open_store(path: PathBuf) -> Result<Arc<SqliteStore>> {
    let store = tokio::task::spawn_blocking(move || {
        let store = SqliteStore::new(path);
        store.migrate_to_latest().map(|()| store)
    })
    .await
    .context("sqlite migration task failed")??;
    info!(path = %store.database_path().display(), "opened workflow database");
    Ok(Arc::new(store))
}

fn parse_overrides(raw: &[String]) -> Result<TemplateOverrides> {
    let mut overrides = TemplateOverrides::new();
    for entry in raw {
        let Some((path, value)) = entry.split_once('=') else {
            bail!("override '{entry}' must look like task_key.option=value");
        };
        let Some((task_key, option)) = path.split_once('.') else {
            bail!("override '{entry}' must name a task key and an option");
        };
        if task_key.is_empty() || option.is_empty() {
            bail!("override '{entry}' must name a task key and an option");
        }
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        overrides
            .entry(task_key.to_string())
            .or_default()
            .insert(option.to_string(), value);
    }
    Ok(overrides)
}

fn print_plan(
    templates: &TemplateLibrary,
    name: &str,
    target: &str,
    overrides: &TemplateOverrides,
) -> Result<()> {
    let template = templates.get(name)?;
    let planned = template.plan(target, overrides)?;

    let mut tasks = Vec::with_capacity(planned.len());
    for task in planned {
        let Some(id) = task.id else {
            bail!("template '{name}' produced a task without a key");
        };
        tasks.push(TaskRecord::pending(
            id,
            task.adapter,
            task.options,
            task.depends_on.into_iter().collect(),
        ));
    }
    let graph = DependencyGraph::validated(&tasks)?;

    println!("{} against {}", template.name, target.trim());
    for (index, phase) in graph.execution_phases().iter().enumerate() {
        println!("phase {}:", index + 1);
        for id in phase {
            let Some(task) = tasks.iter().find(|task| &task.id == id) else {
                continue;
            };
            println!(
                "    {:<12} {:<8} {}",
                id,
                task.adapter,
                serde_json::to_string(&task.options)?
            );
        }
    }
    Ok(())
}

fn print_run(record: &WorkflowRecord, findings: &[ExportedFinding], json: bool) -> Result<()> {
    if json {
        let report = record.status_report();
        let output = RunReport {
            report: &report,
            findings,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }
    print_record(record);
    println!();
    print_findings(findings);
    Ok(())
}

fn print_record(record: &WorkflowRecord) {
    let report = record.status_report();
    println!(
        "workflow {} '{}' against {}: {}",
        record.id,
        record.name,
        record.target,
        record.status.as_str()
    );
    println!("    created  {}", format_time(Some(record.created_at)));
    println!("    started  {}", format_time(record.started_at));
    println!("    finished {}", format_time(record.finished_at));
    if let Some(message) = &record.error_message {
        println!("    error    {message}");
    }
    println!(
        "    tasks: {} total, {} completed, {} failed, {} skipped, {} running, {} pending",
        report.task_count,
        report.completed_count,
        report.failed_count,
        report.skipped_count,
        report.running_count,
        report.pending_count
    );
    for task in &record.tasks {
        let detail = match (&task.error, &task.skip_reason) {
            (Some(error), _) => format!(" ({}: {})", error.kind.as_str(), error.message),
            (None, Some(reason)) => format!(" ({reason:?})"),
            (None, None) => String::new(),
        };
        println!(
            "      {:<12} {:<8} {}{detail}",
            task.id,
            task.adapter,
            task.status.as_str()
        );
    }
    let counts: Vec<String> = report
        .findings_summary
        .iter()
        .map(|(severity, count)| format!("{severity}={count}"))
        .collect();
    if !counts.is_empty() {
        println!("    findings: {}", counts.join(" "));
    }
}

fn print_findings(findings: &[ExportedFinding]) {
    if findings.is_empty() {
        println!("no findings");
        return;
    }
    for exported in findings {
        println!(
            "[{:<8}] {} ({} via {}) {}",
            exported.finding.severity,
            exported.finding.title,
            exported.task_id,
            exported.adapter,
            exported.finding.location
        );
    }
}

fn format_time(value: Option<SystemTime>) -> String {
    value
        .and_then(|at| OffsetDateTime::from(at).format(&Rfc3339).ok())
        .unwrap_or_else(|| "-".to_string())
}

fn exit_code(status: WorkflowStatus) -> ExitCode {
    match status {
        WorkflowStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
