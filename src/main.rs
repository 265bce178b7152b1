//! `conductor` CLI - drives the Orchestrator Facade from the command line.
//!
//! This binary is the only place in the crate that installs a global
//! `tracing` subscriber; library code never does, so `conductor` stays safe
//! to embed elsewhere.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{Cell, Table};
use serde_json::{Map, Value};

use conductor::agents::AgentRegistry;
use conductor::config::OrchestratorConfig;
use conductor::orchestrator::Orchestrator;
use conductor::provider::{CompletionRequest, CompletionResponse, ProviderManager};
use conductor::workflow::PhaseDefinition;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Phased multi-agent workflow orchestration engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format.
    #[arg(long, global = true, default_value = "human")]
    format: OutputFormatArg,

    /// Path to the agents directory (default: `./agents`).
    #[arg(long, global = true, default_value = "agents")]
    agents_dir: PathBuf,

    /// Write the full JSON report to this path regardless of `--format`.
    #[arg(long, global = true)]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormatArg {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the system: load config, scan the agents directory, load
    /// the workflow configuration.
    Init {
        /// Path to an alternate provider/config file.
        #[arg(long)]
        provider_config: Option<PathBuf>,
    },

    /// Run the full phased workflow against a prompt.
    Workflow {
        /// The user request to drive the workflow with.
        prompt: String,

        /// JSON object literal providing additional context.
        #[arg(long)]
        context: Option<String>,

        /// Explicit workflow id; generated if omitted.
        #[arg(long)]
        workflow_id: Option<String>,
    },

    /// Run a single agent against a prompt.
    Agent {
        /// Agent type/name to dispatch.
        agent_type: String,

        /// Task prompt.
        prompt: String,

        /// JSON object literal providing additional context.
        #[arg(long)]
        context: Option<String>,
    },

    /// Run multiple agents from a YAML config file.
    Parallel {
        /// Path to a YAML file listing `{agent_type, description?, prompt}`.
        config: PathBuf,
    },

    /// Print a short system status line.
    Status,

    /// Print aggregate health across every wired subsystem.
    Health,

    /// List loaded agent definitions.
    Agents,

    /// List configured workflow phases.
    Phases,
}

/// A `ProviderManager` that never reaches a real provider. `conductor`
/// itself never ships an LLM client (out of scope per spec.md §1); this
/// exists so the CLI can be exercised end-to-end without one configured.
struct UnconfiguredProviderManager;

#[async_trait::async_trait]
impl ProviderManager for UnconfiguredProviderManager {
    async fn complete_with_fallback(
        &self,
        _request: CompletionRequest,
        _preferred_provider: Option<&str>,
    ) -> anyhow::Result<CompletionResponse> {
        anyhow::bail!("no provider manager configured; conductor only defines the adapter contract")
    }

    async fn health_check_all(&self) -> HashMap<String, Value> {
        HashMap::new()
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let format = cli.format;
    let output_path = cli.output.clone();

    match cli.command {
        Commands::Init { provider_config } => {
            let config = OrchestratorConfig::load().context("loading configuration")?;
            let mut summary = Map::new();
            summary.insert("state_dir".into(), Value::String(config.state_dir.clone()));
            summary.insert(
                "provider_config".into(),
                Value::String(
                    provider_config
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "<none>".to_string()),
                ),
            );
            emit("initialized", &Value::Object(summary), format, output_path.as_deref())?;
        }

        Commands::Workflow { prompt, context, workflow_id } => {
            let orchestrator = build_orchestrator(&cli.agents_dir).await?;
            let context = parse_context(context)?;
            let report = orchestrator.execute_workflow(&prompt, context, workflow_id).await?;
            let exit_ok = report.success;
            emit_report("workflow executed", &report, format, output_path.as_deref())?;
            if !exit_ok {
                process::exit(1);
            }
        }

        Commands::Agent { agent_type, prompt, context } => {
            let orchestrator = build_orchestrator(&cli.agents_dir).await?;
            let context = parse_context(context)?;
            let report = orchestrator.execute_single_agent(&agent_type, &prompt, context).await?;
            let exit_ok = report.success;
            emit_report("agent executed", &report, format, output_path.as_deref())?;
            if !exit_ok {
                process::exit(1);
            }
        }

        Commands::Parallel { config } => {
            let orchestrator = build_orchestrator(&cli.agents_dir).await?;
            let raw = std::fs::read_to_string(&config)
                .with_context(|| format!("reading parallel config {}", config.display()))?;
            let specs: Vec<ParallelRequestSpecRaw> =
                serde_yaml::from_str(&raw).context("parsing parallel config as YAML")?;
            let requests = specs
                .into_iter()
                .map(|s| (s.agent_type, s.description, s.prompt))
                .collect();
            let report = orchestrator.execute_parallel_agents(requests, None).await?;
            let exit_ok = report.success;
            emit_report("parallel agents executed", &report, format, output_path.as_deref())?;
            if !exit_ok {
                process::exit(1);
            }
        }

        Commands::Status => {
            let orchestrator = build_orchestrator(&cli.agents_dir).await?;
            let ids = orchestrator.active_workflow_ids().await;
            let mut summary = Map::new();
            summary.insert("active_workflows".into(), Value::from(ids.len()));
            emit("system ready", &Value::Object(summary), format, output_path.as_deref())?;
        }

        Commands::Health => {
            let orchestrator = build_orchestrator(&cli.agents_dir).await?;
            let health = orchestrator.health().await;
            let overall = health.overall_healthy;
            emit("health checked", &serde_json::to_value(&health)?, format, output_path.as_deref())?;
            if !overall {
                process::exit(1);
            }
        }

        Commands::Agents => {
            let registry = AgentRegistry::load_from_dir(&cli.agents_dir)
                .with_context(|| format!("loading agents from {}", cli.agents_dir.display()))?;
            let available = registry.available();
            match format {
                OutputFormatArg::Json => {
                    println!("{}", serde_json::to_string_pretty(&available)?);
                }
                OutputFormatArg::Human => {
                    let mut table = Table::new();
                    table.set_header(vec!["Agent", "Description"]);
                    for (name, description) in &available {
                        table.add_row(vec![Cell::new(name), Cell::new(description)]);
                    }
                    println!("{table}");
                }
            }
        }

        Commands::Phases => {
            let phases = load_phases_from_default_path()?;
            match format {
                OutputFormatArg::Json => {
                    println!("{}", serde_json::to_string_pretty(&phases)?);
                }
                OutputFormatArg::Human => {
                    let mut table = Table::new();
                    table.set_header(vec!["Phase", "Name", "Execution"]);
                    for phase in &phases {
                        let execution = match &phase.execution {
                            conductor::workflow::ExecutionMode::Sequential { .. } => "sequential",
                            conductor::workflow::ExecutionMode::Parallel { .. } => "parallel",
                            conductor::workflow::ExecutionMode::MultiStream { .. } => "multi-stream",
                        };
                        table.add_row(vec![Cell::new(&phase.phase_id), Cell::new(&phase.name), Cell::new(execution)]);
                    }
                    println!("{table}");
                }
            }
        }
    }

    Ok(())
}

#[derive(serde::Deserialize)]
struct ParallelRequestSpecRaw {
    agent_type: String,
    #[serde(default)]
    description: Option<String>,
    prompt: String,
}

async fn build_orchestrator(agents_dir: &std::path::Path) -> Result<Orchestrator> {
    let config = OrchestratorConfig::load().context("loading configuration")?;
    let registry = Arc::new(
        AgentRegistry::load_from_dir(agents_dir)
            .with_context(|| format!("loading agents from {}", agents_dir.display()))?,
    );
    let (phases, max_context_packages) = load_phases(&config.workflow.config_path).unwrap_or_default();
    let provider_manager: Arc<dyn ProviderManager> = Arc::new(UnconfiguredProviderManager);
    Orchestrator::with_context_limits(config, registry, phases, provider_manager, max_context_packages)
        .await
        .map_err(anyhow::Error::from)
}

/// Parses the workflow config YAML file, returning its phases plus the
/// optional `context_limits.context_packages` cap (spec.md §6).
fn load_phases(config_path: &str) -> Option<(Vec<PhaseDefinition>, Option<usize>)> {
    let raw = std::fs::read_to_string(config_path).ok()?;
    #[derive(serde::Deserialize)]
    struct WorkflowFile {
        workflow: WorkflowBlock,
        #[serde(default)]
        context_limits: Option<ContextLimits>,
    }
    #[derive(serde::Deserialize)]
    struct WorkflowBlock {
        phases: std::collections::BTreeMap<String, PhaseDefinition>,
    }
    #[derive(serde::Deserialize)]
    struct ContextLimits {
        context_packages: Option<usize>,
    }
    let parsed: WorkflowFile = serde_yaml::from_str(&raw).ok()?;
    let phases = parsed
        .workflow
        .phases
        .into_iter()
        .map(|(id, mut def)| {
            def.phase_id = id;
            def
        })
        .collect();
    let max_context_packages = parsed.context_limits.and_then(|l| l.context_packages);
    Some((phases, max_context_packages))
}

fn load_phases_from_default_path() -> Result<Vec<PhaseDefinition>> {
    let config = OrchestratorConfig::load().context("loading configuration")?;
    Ok(load_phases(&config.workflow.config_path).unwrap_or_default().0)
}

fn parse_context(raw: Option<String>) -> Result<Option<Map<String, Value>>> {
    match raw {
        None => Ok(None),
        Some(raw) => {
            let value: Value = serde_json::from_str(&raw).context("parsing --context as JSON")?;
            match value {
                Value::Object(map) => Ok(Some(map)),
                _ => anyhow::bail!("--context must be a JSON object"),
            }
        }
    }
}

fn emit(status: &str, payload: &Value, format: OutputFormatArg, output: Option<&std::path::Path>) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(payload)?)
            .with_context(|| format!("writing report to {}", path.display()))?;
    }
    match format {
        OutputFormatArg::Json => println!("{}", serde_json::to_string_pretty(payload)?),
        OutputFormatArg::Human => println!("{status}"),
    }
    Ok(())
}

fn emit_report(
    status: &str,
    report: &conductor::orchestrator::WorkflowReport,
    format: OutputFormatArg,
    output: Option<&std::path::Path>,
) -> Result<()> {
    let value = serde_json::to_value(report)?;
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)
            .with_context(|| format!("writing report to {}", path.display()))?;
    }
    match format {
        OutputFormatArg::Json => println!("{}", serde_json::to_string_pretty(&value)?),
        OutputFormatArg::Human => {
            println!("{status}: success={}", report.success);
            if !report.phase_summaries.is_empty() {
                let mut table = Table::new();
                table.set_header(vec!["Phase", "Status", "Agents", "Successful", "Time (s)"]);
                for phase in &report.phase_summaries {
                    table.add_row(vec![
                        Cell::new(&phase.id),
                        Cell::new(format!("{:?}", phase.status)),
                        Cell::new(phase.agents_executed),
                        Cell::new(phase.successful_agents),
                        Cell::new(format!("{:.2}", phase.execution_time)),
                    ]);
                }
                println!("{table}");
            }
        }
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("conductor=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("conductor=info,warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
