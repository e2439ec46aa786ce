//! Tether Core - Resilient TCP bridge for stdio JSON-RPC services.
//!
//! Many JSON-RPC services only speak newline-delimited JSON over their own
//! stdin/stdout. This crate makes such a service reachable over TCP and keeps
//! the session usable when either hop fails:
//!
//! - [`BridgeServer`] accepts TCP connections and gives each one a dedicated,
//!   supervised subprocess, restarting it within a budget when it dies.
//! - [`ReconnectingClient`] exposes a remote bridge as a local stdio pair,
//!   redialing on loss and holding back requests until initialization
//!   completes.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::{CancellationToken, ClientOptions, ReconnectingClient};
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let client = ReconnectingClient::new(ClientOptions::new("10.0.0.5", 8080));
//!     let exit = client
//!         .run(tokio::io::stdin(), tokio::io::stdout(), CancellationToken::new())
//!         .await?;
//!     eprintln!("client stopped: {}", exit);
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod supervisor;

// Re-export commonly used types
pub use bridge::{BridgeOutcome, BridgeServer, BridgeServerHandle, ConnectionBridge};
pub use client::{ClientExit, ReconnectingClient};
pub use config::{ClientOptions, ServerOptions, SupervisorOptions};
pub use error::{Result, TetherError};
pub use protocol::{ControlFrame, Frame, RequestId};
pub use supervisor::ProcessSupervisor;
pub use tokio_util::sync::CancellationToken;
