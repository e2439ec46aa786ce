//! Supervised RPC subprocess.

use super::terminate::terminate_child;
use crate::codec;
use crate::config::{CodecConfig, SupervisorConfig, SupervisorOptions};
use crate::protocol::Frame;
use crate::{Result, TetherError};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Something that happened on the stdout of one generation.
#[derive(Debug)]
struct StdoutEvent {
    generation: u64,
    kind: StdoutEventKind,
}

#[derive(Debug)]
enum StdoutEventKind {
    Frame(Frame),
    Closed,
}

/// Owns one subprocess that speaks newline-delimited JSON-RPC over stdio.
///
/// Every successful [`start`](Self::start) opens a new *generation*. A reader
/// task per generation decodes stdout into a channel that outlives restarts,
/// so [`read_message`](Self::read_message) keeps working across them, and
/// [`subscribe`](Self::subscribe) lets pumps wait for the next generation
/// instead of polling.
pub struct ProcessSupervisor {
    command: Vec<String>,
    options: SupervisorOptions,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    frames_tx: mpsc::Sender<StdoutEvent>,
    frames_rx: Mutex<mpsc::Receiver<StdoutEvent>>,
    generation: watch::Sender<u64>,
    restart_count: AtomicU32,
    auto_restart: AtomicBool,
    closed: AtomicBool,
    last_start: StdMutex<Option<Instant>>,
    readers: StdMutex<Vec<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    /// Create a supervisor for `command` (program followed by its arguments).
    /// Nothing is spawned until [`start`](Self::start).
    pub fn new(command: Vec<String>, options: SupervisorOptions) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(SupervisorConfig::FRAME_CHANNEL_CAPACITY);
        let (generation, _) = watch::channel(0);
        let auto_restart = AtomicBool::new(options.auto_restart);

        Self {
            command,
            options,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            frames_tx,
            frames_rx: Mutex::new(frames_rx),
            generation,
            restart_count: AtomicU32::new(0),
            auto_restart,
            closed: AtomicBool::new(false),
            last_start: StdMutex::new(None),
            readers: StdMutex::new(Vec::new()),
        }
    }

    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    /// Spawn the subprocess with stdin, stdout and stderr piped.
    pub async fn start(&self) -> Result<()> {
        let (program, args) = self.command.split_first().ok_or_else(|| TetherError::Spawn {
            command: String::new(),
            message: "empty command".to_string(),
        })?;

        info!("Starting subprocess: {}", self.command_line());

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TetherError::Spawn {
                command: self.command_line(),
                message: e.to_string(),
            })?;

        let pid = child.id();
        let generation = *self.generation.borrow() + 1;

        let mut handles = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            handles.push(tokio::spawn(pump_stdout(
                stdout,
                generation,
                self.frames_tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            handles.push(tokio::spawn(log_stderr(stderr, pid)));
        }

        *self.stdin.lock().await = child.stdin.take();
        *self.child.lock().await = Some(child);
        self.set_last_start(Instant::now());
        {
            let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
            readers.retain(|h| !h.is_finished());
            readers.extend(handles);
        }
        self.generation.send_replace(generation);

        info!("Subprocess started with PID {:?} (generation {})", pid, generation);
        Ok(())
    }

    /// True iff a process handle exists and it has not exited.
    pub async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Write one frame to the subprocess's stdin, verbatim.
    pub async fn send_message(&self, frame: &Frame) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(TetherError::NotStarted)?;
        codec::write_line(stdin, frame.raw()).await
    }

    /// Wait for the next frame from the subprocess.
    ///
    /// Returns `Ok(None)` when the current generation's stdout closes. Frames
    /// still buffered from an earlier generation are delivered; its close
    /// marker is skipped. Malformed output never reaches this point.
    pub async fn read_message(&self) -> Result<Option<Frame>> {
        if self.generation() == 0 {
            return Err(TetherError::NotStarted);
        }

        let mut rx = self.frames_rx.lock().await;
        loop {
            // `self` holds a sender, so the channel never closes under us
            let Some(event) = rx.recv().await else {
                return Ok(None);
            };
            match event.kind {
                StdoutEventKind::Frame(frame) => return Ok(Some(frame)),
                StdoutEventKind::Closed if event.generation == self.generation() => {
                    debug!("Subprocess stdout closed (generation {})", event.generation);
                    return Ok(None);
                }
                StdoutEventKind::Closed => continue,
            }
        }
    }

    /// Restart the subprocess if policy allows.
    ///
    /// Fails without side effects when auto-restart is off
    /// ([`TetherError::RestartDisabled`]) or the budget is spent
    /// ([`TetherError::RestartBudgetExhausted`]). Otherwise waits out the
    /// cooldown, terminates the old process and starts a new one, returning
    /// the start error if that fails.
    pub async fn restart(&self) -> Result<()> {
        if !self.auto_restart() {
            return Err(TetherError::RestartDisabled);
        }

        let count = self.restart_count();
        if count >= self.options.max_restarts {
            error!(
                "Max restarts ({}) reached, not restarting",
                self.options.max_restarts
            );
            return Err(TetherError::RestartBudgetExhausted { restarts: count });
        }

        let cooldown = self.cooldown_for(count);
        if let Some(last_start) = self.last_start() {
            let elapsed = last_start.elapsed();
            if elapsed < cooldown {
                let wait = cooldown - elapsed;
                info!("Waiting {:.1}s before restart (cooldown)", wait.as_secs_f64());
                tokio::time::sleep(wait).await;
            }
        }

        // close() may have run during the cooldown
        if !self.auto_restart() {
            return Err(TetherError::RestartDisabled);
        }

        let attempt = self.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Restarting subprocess (attempt {}/{})",
            attempt, self.options.max_restarts
        );

        self.terminate().await;
        self.start().await?;
        info!("Subprocess restarted successfully");
        Ok(())
    }

    /// Give back one unit of restart budget, floored at zero.
    pub fn forgive_restart(&self) {
        let _ = self
            .restart_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Disable auto-restart, terminate the subprocess and stop its readers.
    /// Safe to call more than once.
    pub async fn close(&self) {
        self.auto_restart.store(false, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(pid) = self.terminate().await {
            info!("Subprocess {} terminated", pid);
        }
        self.abort_readers();
    }

    /// Watch the generation counter; it changes on every successful start.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::SeqCst)
    }

    pub fn auto_restart(&self) -> bool {
        self.auto_restart.load(Ordering::SeqCst)
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    fn cooldown_for(&self, restart_count: u32) -> Duration {
        if restart_count == 0 {
            self.options.first_restart_cooldown
        } else {
            self.options.restart_cooldown
        }
    }

    /// Close stdin and terminate the current process, if any.
    async fn terminate(&self) -> Option<u32> {
        drop(self.stdin.lock().await.take());
        let child = self.child.lock().await.take()?;
        let pid = child.id();

        if let Err(e) = terminate_child(child, self.options.terminate_grace).await {
            warn!("Error terminating subprocess {:?}: {}", pid, e);
        }
        pid
    }

    fn last_start(&self) -> Option<Instant> {
        *self.last_start.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_start(&self, at: Instant) {
        *self.last_start.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    fn abort_readers(&self) {
        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in readers.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // The child itself is covered by kill_on_drop
        self.abort_readers();
    }
}

/// Decode one generation's stdout into the shared frame channel.
async fn pump_stdout(stdout: ChildStdout, generation: u64, tx: mpsc::Sender<StdoutEvent>) {
    let mut reader = BufReader::with_capacity(CodecConfig::READ_BUFFER_SIZE, stdout);

    loop {
        match codec::read_line(&mut reader).await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Frame::parse(line) {
                    Ok(frame) => {
                        let event = StdoutEvent {
                            generation,
                            kind: StdoutEventKind::Frame(frame),
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => error!("Dropping malformed frame from subprocess: {}", e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("Failed reading subprocess stdout: {}", e);
                break;
            }
        }
    }

    let _ = tx
        .send(StdoutEvent {
            generation,
            kind: StdoutEventKind::Closed,
        })
        .await;
}

async fn log_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut reader = BufReader::new(stderr);
    while let Ok(Some(line)) = codec::read_line(&mut reader).await {
        if !line.trim().is_empty() {
            warn!("Subprocess {:?} stderr: {}", pid, line);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn fast_options() -> SupervisorOptions {
        SupervisorOptions::default()
            .with_cooldowns(Duration::from_millis(300), Duration::from_millis(100))
            .with_terminate_grace(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let sup = ProcessSupervisor::new(vec!["cat".to_string()], fast_options());
        sup.start().await.unwrap();
        assert!(sup.is_alive().await);
        assert_eq!(sup.generation(), 1);

        let frame = Frame::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
        sup.send_message(&frame).await.unwrap();

        let echoed = sup.read_message().await.unwrap().unwrap();
        assert_eq!(echoed.raw(), frame.raw());

        sup.close().await;
        assert!(!sup.is_alive().await);
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let sup = ProcessSupervisor::new(vec!["cat".to_string()], fast_options());
        let frame = Frame::from_value(json!({"id": 1}));
        assert!(matches!(
            sup.send_message(&frame).await,
            Err(TetherError::NotStarted)
        ));
        assert!(matches!(sup.read_message().await, Err(TetherError::NotStarted)));
        assert!(!sup.is_alive().await);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let sup = ProcessSupervisor::new(
            vec!["/nonexistent/tether-test-binary".to_string()],
            fast_options(),
        );
        assert!(matches!(sup.start().await, Err(TetherError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_malformed_output_is_dropped() {
        let sup = ProcessSupervisor::new(
            sh(r#"echo 'garbage'; echo '{"id":1,"result":"ok"}'; sleep 5"#),
            fast_options(),
        );
        sup.start().await.unwrap();

        let frame = sup.read_message().await.unwrap().unwrap();
        assert_eq!(frame.value()["result"], "ok");
        sup.close().await;
    }

    #[tokio::test]
    async fn test_read_returns_none_when_stdout_closes() {
        let sup = ProcessSupervisor::new(sh("exit 0"), fast_options());
        sup.start().await.unwrap();
        assert!(sup.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restart_respects_budget_and_cooldown() {
        let options = fast_options().with_max_restarts(2);
        let sup = ProcessSupervisor::new(sh("exit 1"), options);
        let started = Instant::now();
        sup.start().await.unwrap();

        sup.restart().await.unwrap();
        let first = started.elapsed();
        sup.restart().await.unwrap();
        let second = started.elapsed();

        // First restart uses the relaxed cooldown, the second the baseline
        assert!(first >= Duration::from_millis(100));
        assert!(second >= Duration::from_millis(400));

        assert_eq!(sup.restart_count(), 2);
        assert!(matches!(
            sup.restart().await,
            Err(TetherError::RestartBudgetExhausted { restarts: 2 })
        ));
        assert_eq!(sup.restart_count(), 2);
        assert_eq!(sup.generation(), 3);
    }

    #[tokio::test]
    async fn test_forgive_restart_floors_at_zero() {
        let sup = ProcessSupervisor::new(sh("exit 0"), fast_options());
        sup.start().await.unwrap();
        sup.restart().await.unwrap();
        assert_eq!(sup.restart_count(), 1);

        sup.forgive_restart();
        sup.forgive_restart();
        assert_eq!(sup.restart_count(), 0);
    }

    #[tokio::test]
    async fn test_no_restart_when_disabled_or_closed() {
        let sup = ProcessSupervisor::new(
            sh("exit 0"),
            fast_options().with_auto_restart(false),
        );
        sup.start().await.unwrap();
        assert!(matches!(sup.restart().await, Err(TetherError::RestartDisabled)));
        assert_eq!(sup.restart_count(), 0);

        let sup = ProcessSupervisor::new(sh("sleep 5"), fast_options());
        sup.start().await.unwrap();
        sup.close().await;
        sup.close().await;
        assert!(!sup.auto_restart());
        assert!(matches!(sup.restart().await, Err(TetherError::RestartDisabled)));
    }

    #[tokio::test]
    async fn test_restart_replaces_process() {
        let sup = ProcessSupervisor::new(vec!["cat".to_string()], fast_options());
        sup.start().await.unwrap();
        let first_pid = sup.pid().await;
        let mut generations = sup.subscribe();

        sup.restart().await.unwrap();
        assert!(generations.has_changed().unwrap());
        assert_ne!(sup.pid().await, first_pid);
        assert!(sup.is_alive().await);

        // The new generation is wired to the same frame channel
        let frame = Frame::from_value(json!({"id": "after-restart"}));
        sup.send_message(&frame).await.unwrap();
        let echoed = sup.read_message().await.unwrap().unwrap();
        assert_eq!(echoed.value()["id"], "after-restart");
        sup.close().await;
    }
}
