//! The `orrery` binary: run and validate pipelines, drive agent sessions,
//! and serve the HTTP surface.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use orrery_pipeline::{
    apply_transforms, default_registry, default_transforms, validate, AutoApproveInterviewer,
    Engine, LlmCodergenBackend, PipelineGraph, Severity,
};
use orrery_types::events::EventBus;

#[derive(Parser)]
#[command(name = "orrery", version, about = "Graph-driven orchestration for LLM workflows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse, validate, and execute a pipeline file
    Run {
        /// Path to the pipeline source file
        file: PathBuf,

        /// Directory for run logs, checkpoints, and artifacts
        #[arg(long, default_value = ".orrery/logs")]
        logs: PathBuf,
    },

    /// Start an interactive agent session
    Agent {
        /// Model to use (defaults to the provider's standard model)
        #[arg(long)]
        model: Option<String>,

        /// Provider: anthropic, openai, or gemini
        #[arg(long)]
        provider: Option<String>,

        /// Maximum assistant turns (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        max_turns: usize,

        /// Prompt; read from stdin when omitted
        prompt: Option<String>,
    },

    /// Start the HTTP pipeline server
    Serve {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,
    },

    /// Validate a pipeline file and print diagnostics
    Validate {
        /// Path to the pipeline source file
        file: PathBuf,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { file, logs } => cmd_run(&file, &logs).await,
        Commands::Agent {
            model,
            provider,
            max_turns,
            prompt,
        } => cmd_agent(model, provider, max_turns, prompt).await,
        Commands::Serve { addr } => cmd_serve(&addr).await,
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Version => {
            println!("orrery {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_graph(path: &Path) -> anyhow::Result<PipelineGraph> {
    let source = std::fs::read_to_string(path)?;
    let graph = orrery_pipeline::load_pipeline(&source)?;
    Ok(graph)
}

fn print_diagnostics(graph: &PipelineGraph) -> bool {
    let diagnostics = validate(graph);
    let mut has_error = false;
    for diag in &diagnostics {
        if diag.severity == Severity::Error {
            has_error = true;
        }
        let location = diag
            .node_id
            .as_deref()
            .map(|id| format!(" [{id}]"))
            .or_else(|| {
                diag.edge
                    .as_ref()
                    .map(|(from, to)| format!(" [{from} -> {to}]"))
            })
            .unwrap_or_default();
        println!("{}: {}{}: {}", diag.severity, diag.rule, location, diag.message);
    }
    has_error
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let graph = load_graph(path)?;
    let has_error = print_diagnostics(&graph);
    if has_error {
        std::process::exit(1);
    }
    println!("valid: {} nodes, {} edges", graph.node_count(), graph.all_edges().len());
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received; cancelling");
            handle.cancel();
        }
    });
    token
}

async fn cmd_run(path: &Path, logs: &Path) -> anyhow::Result<()> {
    let mut graph = load_graph(path)?;
    if print_diagnostics(&graph) {
        std::process::exit(1);
    }
    apply_transforms(&mut graph, &default_transforms())?;

    println!("running pipeline: {}", graph.name);
    if !graph.goal.is_empty() {
        println!("goal: {}", graph.goal);
    }

    let backend = match orrery_llm::global() {
        Ok(client) => Some(Arc::new(LlmCodergenBackend::new(client, default_model(None)))
            as Arc<dyn orrery_pipeline::CodergenBackend>),
        Err(err) => {
            eprintln!("note: no LLM provider configured ({err}); codergen stages will simulate");
            None
        }
    };

    let bus = EventBus::new();
    bus.on(|event| {
        if let Ok(json) = serde_json::to_string(event) {
            eprintln!("{json}");
        }
    });
    let registry = default_registry(bus.clone(), Arc::new(AutoApproveInterviewer), backend);
    let engine = Engine::new(registry, bus).with_logs_root(logs);

    let token = cancel_on_ctrl_c();
    let result = engine.run(&graph, &token).await?;

    println!(
        "pipeline {}: status={}, stages={}",
        graph.name,
        result.status.as_str(),
        result.completed_nodes.len()
    );
    if !result.status.is_passing() {
        std::process::exit(1);
    }
    Ok(())
}

fn detect_provider() -> String {
    if std::env::var("ANTHROPIC_API_KEY").is_ok() {
        "anthropic".into()
    } else if std::env::var("OPENAI_API_KEY").is_ok() {
        "openai".into()
    } else if std::env::var("GEMINI_API_KEY").is_ok() || std::env::var("GOOGLE_API_KEY").is_ok() {
        "gemini".into()
    } else {
        "anthropic".into()
    }
}

fn default_model(provider: Option<&str>) -> String {
    match provider.unwrap_or("anthropic") {
        "openai" => "gpt-4.1".into(),
        "gemini" => "gemini-2.5-pro".into(),
        _ => "claude-sonnet-4-5".into(),
    }
}

async fn cmd_agent(
    model: Option<String>,
    provider: Option<String>,
    max_turns: usize,
    prompt: Option<String>,
) -> anyhow::Result<()> {
    let client = Arc::new(orrery_llm::Client::from_env().map_err(|err| {
        anyhow::anyhow!(
            "{err}\nset one of: ANTHROPIC_API_KEY, OPENAI_API_KEY, GEMINI_API_KEY, GOOGLE_API_KEY"
        )
    })?);

    let provider = provider.unwrap_or_else(detect_provider);
    let model = model.unwrap_or_else(|| default_model(Some(&provider)));
    let mut profile = orrery_agent::profile_for_provider(&provider, &model);

    let work_dir = std::env::current_dir()?;
    profile.system_prompt = orrery_agent::build_system_prompt(&profile, &work_dir, "");

    let env = Arc::new(orrery_tools::LocalEnvironment::new(&work_dir));
    let config = orrery_agent::SessionConfig {
        max_turns,
        ..Default::default()
    };
    let session = orrery_agent::AgentSession::new(client, profile, env, config);

    // Stream progress to stderr; the final text goes to stdout.
    session.bus().on(|event| {
        use orrery_types::events::EventKind;
        match event.kind {
            EventKind::ToolCallStarted => {
                if let Some(name) = event.data.get("tool_name").and_then(|v| v.as_str()) {
                    eprintln!("  [tool] {name}");
                }
            }
            EventKind::LoopDetected => eprintln!("  [warn] tool-call loop detected"),
            EventKind::Error => {
                if let Some(msg) = event.data.get("error").and_then(|v| v.as_str()) {
                    eprintln!("  [error] {msg}");
                }
            }
            _ => {}
        }
    });

    let prompt = match prompt {
        Some(p) => p,
        None => {
            eprint!("enter prompt: ");
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer.trim().to_string()
        }
    };
    if prompt.is_empty() {
        anyhow::bail!("no prompt provided");
    }

    let token = cancel_on_ctrl_c();
    let answer = session.submit(&token, &prompt).await?;
    session.close();
    println!("{answer}");
    Ok(())
}

async fn cmd_serve(addr: &str) -> anyhow::Result<()> {
    let registry = orrery_server::RunRegistry::new().with_backend_from_env();
    orrery_server::serve(addr, registry).await?;
    Ok(())
}
