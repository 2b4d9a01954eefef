//! Colony CLI
//!
//! Thin driver over colony-core: deploys agents from a config file and runs
//! their loops until interrupted, or executes a single workflow file and
//! prints its event stream.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::Style;
use futures::StreamExt;

use colony_core::capability::demo_capabilities;
use colony_core::llm::{HttpChatModel, StubModel};
use colony_core::scheduler::LoopRegistry;
use colony_core::workflow::{NodeEventKind, Workflow};
use colony_core::{AgentRuntime, RuntimeConfig};

#[derive(Parser)]
#[command(name = "colony", version, about = "Autonomous multi-agent runtime")]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the deterministic stub model instead of an HTTP backend
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy the configured agents and run their loops until Ctrl-C
    Run,
    /// Execute a workflow definition file and print its events
    Workflow {
        /// Path to a workflow JSON file
        file: PathBuf,
        /// Input payload as JSON
        #[arg(long, default_value = "{}")]
        input: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "colony=info,colony_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };

    let runtime = build_runtime(config, cli.offline)?;

    match cli.command {
        Command::Run => run_agents(runtime).await,
        Command::Workflow { file, input } => run_workflow(runtime, &file, &input).await,
    }
}

fn build_runtime(config: RuntimeConfig, offline: bool) -> Result<Arc<AgentRuntime>> {
    let model: Arc<dyn colony_core::llm::ChatModel> = if offline {
        Arc::new(StubModel::new())
    } else {
        Arc::new(
            HttpChatModel::new(&config.model, config.retry.clone())
                .map_err(|e| anyhow::anyhow!("failed to build model client: {e}"))?,
        )
    };

    let runtime = Arc::new(AgentRuntime::new(config, model));
    for capability in demo_capabilities() {
        runtime.capabilities.register(capability);
    }
    Ok(runtime)
}

async fn run_agents(runtime: Arc<AgentRuntime>) -> Result<()> {
    let bold = Style::new().bold();
    let green = Style::new().green();

    if runtime.config.agents.is_empty() {
        anyhow::bail!("no agents configured; add an `agents:` section to the config file");
    }

    let registry = LoopRegistry::new();
    for spec in runtime.config.agents.clone() {
        let agent = runtime.agents.deploy(&spec)?;
        registry.start(runtime.clone(), &agent.id);
        println!(
            "{} {} ({:?})",
            green.apply_to("deployed"),
            bold.apply_to(&agent.id),
            agent.autonomy
        );
    }

    println!("{}", bold.apply_to("running; Ctrl-C to stop"));
    tokio::signal::ctrl_c().await?;

    registry.stop_all();
    for agent in runtime.agents.list() {
        println!(
            "{} {}: {} thoughts, {} errors",
            green.apply_to("stopped"),
            agent.id,
            agent.thinking.len(),
            agent.error_count
        );
    }
    Ok(())
}

async fn run_workflow(runtime: Arc<AgentRuntime>, file: &PathBuf, input: &str) -> Result<()> {
    let bold = Style::new().bold();
    let green = Style::new().green();
    let red = Style::new().red();

    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read workflow {}", file.display()))?;
    let workflow: Workflow = serde_json::from_str(&raw).context("invalid workflow JSON")?;
    workflow.validate().context("workflow failed validation")?;

    let input: serde_json::Value = serde_json::from_str(input).context("invalid input JSON")?;

    println!(
        "{} {} ({} nodes)",
        bold.apply_to("executing"),
        workflow.name,
        workflow.nodes.len()
    );

    let mut events = runtime.executor.execute(&workflow, input);
    while let Some(event) = events.next().await {
        let label = match event.kind {
            NodeEventKind::Start => bold.apply_to("start").to_string(),
            NodeEventKind::Complete => green.apply_to("complete").to_string(),
            NodeEventKind::Error => red.apply_to("error").to_string(),
        };
        println!("{:>10}  {}  {}", label, event.node_id, event.data);
    }
    Ok(())
}
