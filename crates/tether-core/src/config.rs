//! Centralized configuration for the tether bridge.
//!
//! Constant tables hold the defaults; the `*Options` structs are what the
//! runtime components take, built from those defaults and overridden by the
//! command line.

use std::time::Duration;

/// Wire framing limits.
pub struct CodecConfig;

impl CodecConfig {
    /// Largest single frame accepted from any stream.
    pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024; // 10MB
    pub const READ_BUFFER_SIZE: usize = 64 * 1024;
}

/// Subprocess supervision policy.
pub struct SupervisorConfig;

impl SupervisorConfig {
    pub const MAX_RESTARTS: u32 = 5;
    pub const RESTART_COOLDOWN: Duration = Duration::from_secs(5);
    /// The first restart is more often a normal exit than a crash loop.
    pub const FIRST_RESTART_COOLDOWN: Duration = Duration::from_secs(1);
    pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);
    pub const FRAME_CHANNEL_CAPACITY: usize = 256;
}

/// Server-side bridge timing.
pub struct BridgeConfig;

impl BridgeConfig {
    pub const DEFAULT_HOST: &'static str = "0.0.0.0";
    pub const DEFAULT_PORT: u16 = 8080;
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    pub const MONITOR_INTERVAL: Duration = Duration::from_secs(2);
    /// Fallback recheck while a pump waits for the subprocess to come back.
    pub const DEAD_PROCESS_RETRY: Duration = Duration::from_millis(500);
}

/// Client-side reconnect and replay timing.
pub struct ClientConfig;

impl ClientConfig {
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 50;
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    pub const INITIAL_HEARTBEAT_DELAY: Duration = Duration::from_secs(5);
    pub const REPLAY_PACING: Duration = Duration::from_millis(10);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CLIENT_VERSION: &'static str = "1.0";
    /// Local input lines read ahead while no connection is up.
    pub const INPUT_CHANNEL_CAPACITY: usize = 256;
}

/// Heartbeat silence beyond this is logged as a timeout.
pub fn heartbeat_timeout(interval: Duration) -> Duration {
    interval * 2
}

/// Options for a [`crate::supervisor::ProcessSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub auto_restart: bool,
    pub max_restarts: u32,
    pub restart_cooldown: Duration,
    pub first_restart_cooldown: Duration,
    pub terminate_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            auto_restart: true,
            max_restarts: SupervisorConfig::MAX_RESTARTS,
            restart_cooldown: SupervisorConfig::RESTART_COOLDOWN,
            first_restart_cooldown: SupervisorConfig::FIRST_RESTART_COOLDOWN,
            terminate_grace: SupervisorConfig::TERMINATE_GRACE,
        }
    }
}

impl SupervisorOptions {
    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Set both cooldowns; the first-restart cooldown never exceeds the baseline.
    pub fn with_cooldowns(mut self, restart: Duration, first_restart: Duration) -> Self {
        self.restart_cooldown = restart;
        self.first_restart_cooldown = first_restart.min(restart);
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }
}

/// Options for the listening bridge server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    /// Subprocess program followed by its arguments.
    pub command: Vec<String>,
    pub heartbeat_interval: Duration,
    pub monitor_interval: Duration,
    pub dead_process_retry: Duration,
    pub supervisor: SupervisorOptions,
}

impl ServerOptions {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            host: BridgeConfig::DEFAULT_HOST.to_string(),
            port: BridgeConfig::DEFAULT_PORT,
            command,
            heartbeat_interval: BridgeConfig::HEARTBEAT_INTERVAL,
            monitor_interval: BridgeConfig::MONITOR_INTERVAL,
            dead_process_retry: BridgeConfig::DEAD_PROCESS_RETRY,
            supervisor: SupervisorOptions::default(),
        }
    }

    pub fn with_bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorOptions) -> Self {
        self.supervisor = supervisor;
        self
    }
}

/// Options for the reconnecting client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub reconnect: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub initial_heartbeat_delay: Duration,
    pub replay_pacing: Duration,
    pub connect_timeout: Duration,
}

impl ClientOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            reconnect: true,
            reconnect_delay: ClientConfig::RECONNECT_DELAY,
            max_reconnect_attempts: ClientConfig::MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval: ClientConfig::HEARTBEAT_INTERVAL,
            initial_heartbeat_delay: ClientConfig::INITIAL_HEARTBEAT_DELAY,
            replay_pacing: ClientConfig::REPLAY_PACING,
            connect_timeout: ClientConfig::CONNECT_TIMEOUT,
        }
    }

    /// Disable reconnection: a single connection attempt, no redial on loss.
    pub fn without_reconnect(mut self) -> Self {
        self.reconnect = false;
        self.max_reconnect_attempts = 1;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_initial_heartbeat_delay(mut self, delay: Duration) -> Self {
        self.initial_heartbeat_delay = delay;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
