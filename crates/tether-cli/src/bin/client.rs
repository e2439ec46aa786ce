//! Tether Client - bridge local stdio to a remote tether server.
//!
//! Stdout carries the protocol, so all logging goes to stderr.

use clap::Parser;
use std::time::Duration;
use tether_cli::{init_logging, parse_seconds};
use tether_core::config::ClientConfig;
use tether_core::{CancellationToken, ClientOptions, ReconnectingClient};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tether-client")]
#[command(about = "Stdio client for remote JSON-RPC servers with reconnection support")]
struct Args {
    /// Remote host to connect to
    host: String,

    /// Remote port to connect to
    port: u16,

    /// Seconds between reconnection attempts
    #[arg(long, default_value = "2", value_parser = parse_seconds)]
    reconnect_delay: Duration,

    /// Maximum number of connection attempts
    #[arg(long, default_value_t = ClientConfig::MAX_RECONNECT_ATTEMPTS)]
    max_reconnect_attempts: u32,

    /// Seconds between heartbeats
    #[arg(long, default_value = "30", value_parser = parse_seconds)]
    heartbeat_interval: Duration,

    /// Disable automatic reconnection
    #[arg(long)]
    no_reconnect: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn client_options(&self) -> ClientOptions {
        let options = ClientOptions::new(self.host.clone(), self.port)
            .with_reconnect_delay(self.reconnect_delay)
            .with_max_reconnect_attempts(self.max_reconnect_attempts)
            .with_heartbeat_interval(self.heartbeat_interval);

        if self.no_reconnect {
            options.without_reconnect()
        } else {
            options
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug, args.json_logs);

    let client = ReconnectingClient::new(args.client_options());
    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted by user");
                shutdown.cancel();
            }
        });
    }

    let code = match client
        .run(tokio::io::stdin(), tokio::io::stdout(), shutdown)
        .await
    {
        Ok(exit) => {
            info!("Client stopped: {}", exit);
            0
        }
        Err(e) => {
            error!("{}", e);
            1
        }
    };

    // A pending blocking read on stdin would keep the runtime from shutting down
    std::process::exit(code);
}
