//! Tether Server - expose a stdio JSON-RPC service over TCP.
//!
//! Every accepted connection gets its own copy of the service, restarted
//! automatically when it dies.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tether_cli::{init_logging, parse_seconds};
use tether_core::config::{BridgeConfig, SupervisorConfig};
use tether_core::{BridgeServer, ServerOptions, SupervisorOptions};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tether-server")]
#[command(about = "TCP proxy for stdio JSON-RPC servers with heartbeat and auto-restart")]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = BridgeConfig::DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = BridgeConfig::DEFAULT_PORT)]
    port: u16,

    /// Seconds between heartbeat responses
    #[arg(long, default_value = "30", value_parser = parse_seconds)]
    heartbeat_interval: Duration,

    /// Restart the subprocess when it dies (default)
    #[arg(long, overrides_with = "no_auto_restart")]
    auto_restart: bool,

    /// Close the connection instead of restarting the subprocess
    #[arg(long, overrides_with = "auto_restart")]
    no_auto_restart: bool,

    /// Restart budget per connection
    #[arg(long, default_value_t = SupervisorConfig::MAX_RESTARTS)]
    max_restarts: u32,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Subprocess command and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

impl Args {
    fn auto_restart(&self) -> bool {
        self.auto_restart || !self.no_auto_restart
    }

    fn server_options(&self) -> ServerOptions {
        let supervisor = SupervisorOptions::default()
            .with_auto_restart(self.auto_restart())
            .with_max_restarts(self.max_restarts);

        ServerOptions::new(self.command.clone())
            .with_bind(self.host.clone(), self.port)
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_supervisor(supervisor)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.json_logs);

    info!("Starting tether server");
    info!(
        "Heartbeat interval: {:.1}s, auto-restart: {}, max restarts: {}",
        args.heartbeat_interval.as_secs_f64(),
        args.auto_restart(),
        args.max_restarts
    );

    let handle = BridgeServer::bind(args.server_options())
        .await
        .with_context(|| format!("failed to listen on {}:{}", args.host, args.port))?;

    info!("Bridge running on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, closing connections");

    handle.shutdown();
    handle.wait().await;

    Ok(())
}
