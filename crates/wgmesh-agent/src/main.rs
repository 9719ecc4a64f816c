//! wgmesh-agent - `WireGuard` mesh node agent
//!
//! Runs on every mesh member and keeps the local interface in step with the
//! topology published by the control plane.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wgmesh_agent::{desired_config, Agent, AgentArgs, AgentConfig};
use wgmesh_topology::DirectoryStore;
use wgmesh_wireguard::{redact_config, IpCommandHost, PrivateKey};

#[derive(Parser)]
#[command(name = "wgmesh-agent")]
#[command(about = "WireGuard mesh node agent")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "WGMESH_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted
    Run(AgentArgs),

    /// Build the configuration once and print it with the key redacted
    Render(AgentArgs),

    /// Print a fresh base64 private key
    Genkey,

    /// Read a private key on stdin and print its public key
    Pubkey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    match cli.command {
        Commands::Run(args) => run_agent(load_config(args)?).await?,
        Commands::Render(args) => render(load_config(args)?).await?,
        Commands::Genkey => println!("{}", PrivateKey::generate().to_base64()),
        Commands::Pubkey => pubkey().await?,
    }

    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("wgmesh=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
    Ok(())
}

fn load_config(args: AgentArgs) -> anyhow::Result<AgentConfig> {
    let hostname = if args.node_name.is_some() {
        None
    } else {
        let raw = hostname::get().context("cannot read system hostname")?;
        Some(
            raw.into_string()
                .map_err(|raw| anyhow::anyhow!("hostname {raw:?} is not valid UTF-8"))?,
        )
    };
    Ok(args.into_config(hostname)?)
}

async fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    info!(
        node = %config.node_name,
        role = %config.role,
        iface = %config.interface,
        store = %config.store_dir.display(),
        dry_run = config.dry_run,
        "starting wgmesh-agent"
    );

    let store = DirectoryStore::open(&config.store_dir, config.store_poll_interval)
        .with_context(|| format!("cannot open topology store {}", config.store_dir.display()))?;
    let agent = Agent::new(config, store, IpCommandHost::new())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "cannot listen for shutdown signals"),
        }
        let _ = shutdown_tx.send(true);
    });

    agent.run(shutdown_rx).await;
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

async fn render(config: AgentConfig) -> anyhow::Result<()> {
    let store = DirectoryStore::open(&config.store_dir, config.store_poll_interval)
        .with_context(|| format!("cannot open topology store {}", config.store_dir.display()))?;
    let desired = desired_config(&store, &config).await?;
    print!("{}", redact_config(&desired));
    Ok(())
}

async fn pubkey() -> anyhow::Result<()> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("cannot read private key from stdin")?;
    let key = PrivateKey::from_base64(&input)?;
    println!("{}", key.public_key());
    Ok(())
}
