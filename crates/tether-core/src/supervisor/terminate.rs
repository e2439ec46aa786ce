//! Graceful subprocess termination.
//!
//! # Platform Behavior
//! - **Linux/macOS**: SIGTERM, wait up to the grace period, then SIGKILL
//! - **Windows**: no SIGTERM equivalent for console children, so the process
//!   is killed immediately

use crate::Result;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

/// Terminate a child process, escalating to a forced kill after `grace`.
///
/// Returns the exit status when it could be collected. A process that has
/// already exited is simply reaped.
pub async fn terminate_child(mut child: Child, grace: Duration) -> Result<Option<ExitStatus>> {
    let pid = child.id();

    if let Some(status) = child.try_wait()? {
        debug!("Process {:?} already exited with {}", pid, status);
        return Ok(Some(status));
    }

    if !request_graceful_exit(&mut child) {
        // Nothing to wait for: already gone, or no graceful path on this platform
        child.kill().await?;
        return Ok(child.try_wait()?);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            let status = status?;
            debug!("Process {:?} terminated gracefully ({})", pid, status);
            Ok(Some(status))
        }
        Err(_) => {
            warn!("Process {:?} didn't terminate within {:?}, killing it", pid, grace);
            child.kill().await?;
            Ok(child.try_wait()?)
        }
    }
}

/// Ask the process to exit. Returns false when there is nothing to wait for.
#[cfg(unix)]
fn request_graceful_exit(child: &mut Child) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };

    debug!("Sending SIGTERM to process {}", pid);
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!("Failed to send SIGTERM to {}: {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn request_graceful_exit(_child: &mut Child) -> bool {
    false
}
