//! `maestro`: runs the agent coordinator and its status server.

mod config;
mod config_watcher;
mod status;

use clap::{Parser, Subcommand};
use config::MaestroConfig;
use config_watcher::ConfigWatcher;
use maestro_coordinator::{
    default_agents, Coordinator, HttpAgentEndpoint, PrometheusSink, TracingMetricsSink,
};
use status::StatusServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "maestro", about = "Maestro: agent, task and workflow coordinator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "maestro.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator loops and the status server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List the agents that would be registered at start-up
    Agents,
    /// Validate the config file and exit
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = MaestroConfig::load(&cli.config)?;
    maestro_core::telemetry::init_tracing("info", config.server.json_logs);
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Serve { host, port } => serve(cli.config, config, host, port).await?,
        Commands::Agents => list_agents(&config),
        Commands::Check => {
            config.validate()?;
            println!(
                "{}: ok ({} agent(s), {} polic(ies), {} workflow(s))",
                cli.config.display(),
                config.agents.len(),
                config.policies.len(),
                config.workflows.len()
            );
        }
    }
    Ok(())
}

async fn serve(
    config_path: PathBuf,
    config: MaestroConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    config.validate()?;
    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);

    let prometheus = Arc::new(PrometheusSink::new()?);
    let coordinator = Arc::new(
        Coordinator::new(config.coordinator, Arc::new(HttpAgentEndpoint::new()))?
            .with_sink(prometheus.clone())
            .with_sink(Arc::new(TracingMetricsSink)),
    );

    coordinator.bootstrap().await;
    for agent in config.agents {
        coordinator.register_agent(agent).await;
    }
    coordinator.policies().replace_all(config.policies);
    for workflow in config.workflows {
        coordinator.define_workflow(workflow).await?;
    }
    info!(
        agents = coordinator.registry().len().await,
        policies = coordinator.policies().len(),
        workflows = coordinator.workflows().list().await.len(),
        "Coordinator configured"
    );

    // Hot-reload is best effort; a missing file just means no watch.
    let _watcher = match ConfigWatcher::watch_policies(
        config_path,
        Duration::from_millis(500),
        coordinator.policies().clone(),
    ) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Policy hot-reload disabled");
            None
        }
    };

    let handle = coordinator.start();
    let app = StatusServer::build(coordinator.clone(), prometheus);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Maestro status server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    handle.shutdown();
    Ok(())
}

fn list_agents(config: &MaestroConfig) {
    let mut agents = if config.coordinator.bootstrap_agents {
        default_agents()
    } else {
        Vec::new()
    };
    for agent in &config.agents {
        agents.retain(|a| a.id != agent.id);
        agents.push(agent.clone());
    }

    if agents.is_empty() {
        println!("No agents configured.");
        println!("Enable bootstrap_agents or add [[agents]] to maestro.toml");
        return;
    }
    println!("Agents:");
    for agent in &agents {
        println!(
            "  {} ({}) {}",
            agent.id,
            agent.agent_type,
            agent.metadata.address.as_deref().unwrap_or("-")
        );
        let capabilities: Vec<&str> = agent.capabilities.iter().map(|c| c.name.as_str()).collect();
        if !capabilities.is_empty() {
            println!("    capabilities: {}", capabilities.join(", "));
        }
    }
    println!("\nTotal: {} agent(s)", agents.len());
}
