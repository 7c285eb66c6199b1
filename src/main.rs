//! nyanclaw playground CLI
//!
//! A thin development surface over the runtime crate: run one query through
//! the pipeline, poke the watchtower, or inspect registry stats. Providers
//! are discovered from the environment (`.env` is honored).

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nyanclaw_runtime::prelude::*;

#[derive(Parser)]
#[command(name = "nyanclaw", version, about = "nyanclaw pipeline playground")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one query through the pipeline
    Ask {
        /// The query text
        query: String,
        /// Session id for memory continuity
        #[arg(long, default_value = "playground")]
        session: String,
    },
    /// Execute a command through the watchtower (foreground)
    Exec {
        /// The command line to run
        command: String,
        /// Timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Show registry and usage statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            RuntimeConfig::from_toml(&text)?
        }
        None => RuntimeConfig::default(),
    };

    let runtime = PipelineRuntime::new(config, Collaborators::degraded()).await;

    match cli.command {
        Commands::Ask { query, session } => {
            let request = PipelineRequest {
                query,
                tenant_id: tenant_key("127.0.0.1", "nyanclaw-cli", "playground"),
                session_id: Some(session),
                caller_id: "cli".to_string(),
                ..Default::default()
            };
            let response = runtime.run(request).await;
            println!("{}", response.answer);
            eprintln!(
                "\n[{} | mode {} | audit {} ({}%) | package {}]",
                response.badge,
                response.mode,
                response.audit.verdict,
                response.audit.confidence,
                response.data_package_summary.short_id,
            );
        }
        Commands::Exec { command, timeout } => {
            let result = runtime
                .watchtower
                .exec_foreground(
                    &command,
                    ExecOptions {
                        timeout: Some(std::time::Duration::from_secs(timeout)),
                        ..Default::default()
                    },
                )
                .await;
            if !result.stdout.is_empty() {
                println!("{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                eprintln!("{}", result.stderr);
            }
            std::process::exit(result.exit_code.max(0).min(125));
        }
        Commands::Status => {
            let status = serde_json::json!({
                "providers": runtime.chain.chain_snapshot(),
                "store": runtime.store.stats(),
                "memory": runtime.memory.stats(),
                "extraction_cache": runtime.extraction_cache.stats(),
                "watchtower_entries": runtime.watchtower.registry_len(),
                "swarms": runtime.swarm.swarm_count(),
                "usage": runtime.metrics.snapshot(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    runtime.shutdown();
    Ok(())
}
