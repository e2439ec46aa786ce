//! Shared setup for the `tether-server` and `tether-client` binaries.

use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Logs always go to stderr: for the client, stdout is the protocol channel.
/// `RUST_LOG` overrides the level chosen by `debug`.
pub fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

/// Parse a positive number of seconds, as accepted by the interval flags.
pub fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("`{}` is not a number", value))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("`{}` must be a positive number of seconds", value));
    }
    Ok(Duration::from_secs_f64(secs))
}
