//! Error types for the tether bridge.
//!
//! Every failure here is contained within one connection. The listener and
//! the client's reconnect loop decide what to do with them; nothing in this
//! enum is fatal to the process on its own.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the tether library.
#[derive(Debug, Error)]
pub enum TetherError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid address {addr}: {message}")]
    InvalidAddress { addr: String, message: String },

    #[error("Connection to {addr} failed: {message}")]
    ConnectionFailed { addr: String, message: String },

    #[error("Gave up connecting to {addr} after {attempts} attempts")]
    ReconnectExhausted { addr: String, attempts: u32 },

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    // Subprocess lifecycle errors
    #[error("Failed to spawn `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("Subprocess not started")]
    NotStarted,

    #[error("Restart budget exhausted after {restarts} restarts")]
    RestartBudgetExhausted { restarts: u32 },

    #[error("Auto-restart is disabled")]
    RestartDisabled,

    // Initialization ordering
    #[error("Server initialization pending")]
    InitializationPending,

    #[error("Operation was cancelled")]
    Cancelled,
}

/// Result type alias for tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TetherError {
    /// Convert to a JSON-RPC error code.
    ///
    /// Application-defined codes live in -32000 to -32099:
    /// - -32000: connectivity error
    /// - -32002: initialization pending (retry after `notifications/initialized`)
    /// - -32003: subprocess lifecycle error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            TetherError::ConnectionFailed { .. }
            | TetherError::ReconnectExhausted { .. }
            | TetherError::Timeout(_) => -32000,

            TetherError::InitializationPending => -32002,

            TetherError::Spawn { .. }
            | TetherError::NotStarted
            | TetherError::RestartBudgetExhausted { .. }
            | TetherError::RestartDisabled => -32003,

            TetherError::Json { .. } | TetherError::FrameTooLarge { .. } => -32700,

            _ => -32603,
        }
    }

    /// Check if this error should trigger another connection attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TetherError::ConnectionFailed { .. } | TetherError::Timeout(_) | TetherError::Io { .. }
        )
    }
}
