//! Server side: bridge TCP connections to supervised subprocesses.
//!
//! Each accepted connection gets a dedicated subprocess. Frames flow both
//! ways unchanged, except that control frames from the peer are consumed
//! here and a `$/serverRestarted` notice is injected after every successful
//! restart.
//!
//! # Example
//!
//! ```no_run
//! use tether_core::{BridgeServer, ServerOptions};
//!
//! # async fn example() -> tether_core::Result<()> {
//! let options = ServerOptions::new(vec!["my-rpc-server".into()]).with_bind("127.0.0.1", 8080);
//! let handle = BridgeServer::bind(options).await?;
//! println!("listening on {}", handle.addr());
//! # Ok(())
//! # }
//! ```

mod connection;
mod server;
mod state;

pub use connection::{BridgeOutcome, ConnectionBridge, ConnectionId};
pub use server::{BridgeServer, BridgeServerHandle};
pub use state::{BridgePhase, ConnectionState, PendingRequestTable};
