//! Client side: expose a remote bridge as a local stdio-style stream pair.
//!
//! The client redials with a fixed delay whenever the connection drops and
//! shields the remote subprocess from requests that arrive before the
//! initialization handshake has completed. Those are answered locally with
//! a `-32002` retry hint and replayed, in order, once
//! `notifications/initialized` has been forwarded.

mod session;
mod state;

pub use session::{ClientExit, ReconnectingClient};
pub use state::{ClientState, LocalRoute};
