use anyhow::Result;
use clap::Parser;
use mcpd::{backend::ServerManager, bus::NotificationBus, config, rest, AppContext};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "mcpd",
    about = "MCP host — multiplexes AI clients onto stdio backend servers",
    version
)]
struct Args {
    /// HTTP listen port
    #[arg(long, default_value_t = 4400, env = "MCPD_PORT")]
    port: u16,

    /// Path to the backend servers file
    #[arg(long, default_value = "mcp-servers.json", env = "MCPD_SERVERS")]
    servers: std::path::PathBuf,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MCPD_LOG")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log))
        .compact()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        "mcpd starting"
    );

    // Exit 1: config file unreadable or unparseable.
    let backends = match config::load_backends(&args.servers) {
        Ok(b) => b,
        Err(e) => {
            error!(err = %e, path = %args.servers.display(), "failed to load servers file");
            std::process::exit(1);
        }
    };

    let config = Arc::new(config::HostConfig::new(
        args.port,
        args.servers.clone(),
        args.log.clone(),
    ));
    let bus = Arc::new(NotificationBus::new());
    let manager = ServerManager::new();
    manager.start(backends).await;

    let ctx = Arc::new(AppContext {
        config,
        bus,
        manager,
        started_at: std::time::Instant::now(),
    });

    // Exit 2: could not bind the listen port.
    let listener = match rest::bind(ctx.config.port).await {
        Ok(l) => l,
        Err(e) => {
            error!(err = %e, "failed to bind");
            std::process::exit(2);
        }
    };

    rest::serve(listener, ctx.clone()).await?;

    info!("shutting down backends");
    ctx.manager.stop_all().await;
    Ok(())
}
