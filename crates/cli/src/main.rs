mod config;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    tokio::sync::mpsc,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    junction_gateway::{AppState, Gateway, SessionManager, serve},
    junction_registry::Registry,
};

#[derive(Parser)]
#[command(name = "junction", version, about = "junction — federated MCP gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the configuration file.
    #[arg(long, short, global = true, default_value = "junction.toml", env = "JUNCTION_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides the config value).
    #[arg(long, global = true, env = "JUNCTION_BIND")]
    bind: Option<String>,

    /// Port to listen on (overrides the config value).
    #[arg(long, global = true, env = "JUNCTION_PORT")]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway (default when no subcommand is given).
    Serve,
    /// Validate the configuration file and exit.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command {
        Some(Commands::Check) => check(&cli),
        Some(Commands::Serve) | None => run(cli).await,
    }
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Validate every backend entry and report, failing on the first bad one.
fn check(cli: &Cli) -> anyhow::Result<()> {
    let file = config::load(&cli.config)?;
    for (id, backend) in &file.backends {
        backend
            .validate()
            .with_context(|| format!("backend '{id}' is invalid"))?;
    }
    println!(
        "{}: ok ({} backend(s))",
        cli.config.display(),
        file.backends.len()
    );
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let file = if cli.config.exists() {
        config::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "config file not found, starting with no backends");
        config::FileConfig::default()
    };

    let bind = cli.bind.unwrap_or_else(|| file.gateway.bind.clone());
    let port = cli.port.unwrap_or(file.gateway.port);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind}:{port}"))?;

    // Composition root: the registry, router, and gateway are plain owned
    // values shared by reference from here on.
    let registry = Arc::new(Registry::new());

    let (notif_tx, notif_rx) = mpsc::unbounded_channel();
    registry.set_notification_sender(notif_tx);

    let (health_tx, mut health_rx) = mpsc::unbounded_channel();
    registry.set_health_change_sender(health_tx);
    tokio::spawn(async move {
        while let Some(change) = health_rx.recv().await {
            info!(
                backend = %change.backend,
                from = %change.from,
                to = %change.to,
                "backend health changed"
            );
        }
    });

    for (id, backend) in file.backends {
        if !backend.enabled {
            info!(backend = %id, "skipping disabled backend");
            continue;
        }
        if let Err(e) = registry.register(backend).await {
            warn!(backend = %id, error = %e, "failed to register backend");
        }
    }
    registry.start_health_checks(Duration::from_secs(
        file.gateway.health_check_interval_secs,
    ));

    let sessions = Arc::new(SessionManager::new(Duration::from_secs(
        file.gateway.session_timeout_secs,
    )));
    sessions.spawn_sweeper();

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&registry),
        Arc::clone(&sessions),
    ));
    gateway.spawn_notification_fanout(notif_rx);

    serve(
        addr,
        AppState {
            gateway,
            registry,
            sessions,
        },
    )
    .await
}
