//! Subprocess supervision.
//!
//! A [`ProcessSupervisor`] owns exactly one RPC subprocess for one bridged
//! connection. It starts the process, reports whether it is alive, moves
//! frames over its stdio, and restarts it under a cooldown and attempt budget
//! so a crash-looping child cannot spin the bridge into a restart storm.
//!
//! # Restart policy
//!
//! - At most `max_restarts` restarts (default 5); each successful restart
//!   observed by the bridge gives one back via
//!   [`ProcessSupervisor::forgive_restart`].
//! - Restarts are spaced by `restart_cooldown` (5 s), relaxed to
//!   `first_restart_cooldown` (1 s) while no restart has been counted.
//! - The old process gets SIGTERM and `terminate_grace` (5 s) before SIGKILL.

mod process;
mod terminate;

pub use process::ProcessSupervisor;
pub use terminate::terminate_child;
