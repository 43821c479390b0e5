//! Worker process supervision
//!
//! The supervisor owns the single worker process. Each spawn gets a new
//! generation number; every event the worker produces (output lines, exit) is
//! tagged with it so late events from a replaced process are ignored.
//!
//! # Lifecycle
//!
//! `Starting -> Running -> Exited -> Restarting -> Starting ...`, or `Stopped`
//! after an explicit [`Supervisor::stop`]. When the restart budget is spent the
//! worker stays `Exited` and the multiplexer refuses new invocations.

use crate::config::WorkerConfig;
use crate::framer::LineFramer;
use crate::multiplexer::{Multiplexer, WorkerLink};
use parking_lot::Mutex;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Lifecycle phase of the worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Starting,
    Running,
    Exited,
    Restarting,
    Stopped,
}

impl WorkerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerPhase::Starting => "starting",
            WorkerPhase::Running => "running",
            WorkerPhase::Exited => "exited",
            WorkerPhase::Restarting => "restarting",
            WorkerPhase::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded exponential backoff between restarts
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    max_restarts: u32,
    base_delay: Duration,
    attempts: u32,
}

impl RestartPolicy {
    pub fn new(max_restarts: u32, base_delay: Duration) -> Self {
        Self {
            max_restarts,
            base_delay,
            attempts: 0,
        }
    }

    /// Consume one restart attempt and return the delay before it,
    /// or `None` when the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_restarts {
            return None;
        }
        self.attempts += 1;
        let factor = 2u32.saturating_pow(self.attempts - 1);
        Some(self.base_delay.saturating_mul(factor))
    }

    /// The worker proved stable; later crashes start from attempt 1 again
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }
}

/// Requests delivered to the task that owns the child process
enum Control {
    /// Graceful stop; the sender is notified once exit handling is done
    Terminate(oneshot::Sender<()>),
    /// Immediate kill, used by the watchdog
    Kill,
}

struct SupervisorState {
    phase: WorkerPhase,
    generation: u64,
    policy: RestartPolicy,
    pid: Option<u32>,
    running_since: Option<Instant>,
    last_activity: Option<Instant>,
    control: Option<mpsc::UnboundedSender<Control>>,
    shutting_down: bool,
}

/// Supervisor state as seen by the health endpoint
#[derive(Debug, Clone)]
pub struct SupervisorSnapshot {
    pub phase: WorkerPhase,
    pub generation: u64,
    pub pid: Option<u32>,
    pub restart_attempts: u32,
    pub running_for: Option<Duration>,
    pub since_last_activity: Option<Duration>,
    /// Restart budget spent; the worker will not come back on its own
    pub exhausted: bool,
}

impl SupervisorSnapshot {
    pub fn is_alive(&self) -> bool {
        self.phase == WorkerPhase::Running
    }
}

/// Supervises the worker process and feeds its output to the multiplexer
///
/// Methods that spawn background tasks take `&Arc<Self>` so the tasks can
/// hold their own reference.
pub struct Supervisor {
    config: WorkerConfig,
    mux: Arc<Multiplexer>,
    state: Mutex<SupervisorState>,
}

impl Supervisor {
    pub fn new(config: WorkerConfig, mux: Arc<Multiplexer>) -> Arc<Self> {
        let policy = RestartPolicy::new(config.max_restarts, config.restart_backoff());
        Arc::new(Self {
            config,
            mux,
            state: Mutex::new(SupervisorState {
                phase: WorkerPhase::Starting,
                generation: 0,
                policy,
                pid: None,
                running_since: None,
                last_activity: None,
                control: None,
                shutting_down: false,
            }),
        })
    }

    /// Spawn the worker and start supervising it
    pub fn start(self: &Arc<Self>) {
        if let Some(timeout) = self.config.request_timeout() {
            self.spawn_watchdog(timeout);
        }
        self.launch();
    }

    /// Stop the worker: SIGTERM, wait for the grace period, then SIGKILL.
    /// No restart follows.
    pub async fn stop(&self) {
        let control = {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.control.take()
        };

        if let Some(control) = control {
            let (done_tx, done_rx) = oneshot::channel();
            if control.send(Control::Terminate(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }

        let mut state = self.state.lock();
        state.phase = WorkerPhase::Stopped;
        state.pid = None;
        state.running_since = None;
        info!("Worker supervisor stopped");
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let state = self.state.lock();
        SupervisorSnapshot {
            phase: state.phase,
            generation: state.generation,
            pid: state.pid,
            restart_attempts: state.policy.attempts(),
            running_for: state.running_since.map(|t| t.elapsed()),
            since_last_activity: state.last_activity.map(|t| t.elapsed()),
            exhausted: state.phase == WorkerPhase::Exited
                && state.policy.attempts() >= state.policy.max_restarts(),
        }
    }

    fn launch(self: &Arc<Self>) {
        let generation = {
            let mut state = self.state.lock();
            if state.shutting_down {
                state.phase = WorkerPhase::Stopped;
                return;
            }
            state.generation += 1;
            state.phase = WorkerPhase::Starting;
            state.generation
        };

        info!(
            generation,
            command = %self.config.command,
            args = ?self.config.args,
            "Starting worker process"
        );

        match self.spawn_child() {
            Ok(child) => self.supervise(generation, child),
            Err(e) => {
                error!(generation, command = %self.config.command, error = %e, "Failed to spawn worker process");
                self.handle_exit(generation, None);
            }
        }
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        cmd.spawn()
    }

    /// Wire up a freshly spawned child and hand it to its wait task
    fn supervise(self: &Arc<Self>, generation: u64, mut child: Child) {
        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            error!(generation, "Worker process is missing piped stdio");
            let _ = child.start_kill();
            self.handle_exit(generation, None);
            return;
        };

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        {
            let mut state = self.state.lock();
            if state.shutting_down {
                // stop() ran while the process was starting and found nothing to terminate
                drop(state);
                warn!(generation, pid = ?pid, "Shutdown requested during startup, killing worker");
                let _ = child.start_kill();
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                return;
            }
            state.phase = WorkerPhase::Running;
            state.pid = pid;
            state.running_since = Some(Instant::now());
            state.last_activity = Some(Instant::now());
            state.control = Some(control_tx);
        }
        info!(generation, pid = ?pid, "Worker process started");

        // Attach before reading so the first output line already has a home
        self.mux.attach_worker(WorkerLink::new(generation, line_tx));

        tokio::spawn(write_stdin(generation, stdin, line_rx));
        tokio::spawn(Arc::clone(self).read_stdout(generation, stdout));
        tokio::spawn(log_stderr(generation, stderr));

        self.spawn_stability_timer(generation);
        self.spawn_discovery(generation);

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.wait_child(generation, child, control_rx).await;
        });
    }

    async fn wait_child(
        self: Arc<Self>,
        generation: u64,
        mut child: Child,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
    ) {
        let outcome = tokio::select! {
            status = child.wait() => Ok(status),
            control = control_rx.recv() => Err(control),
        };

        let mut done = None;
        let status = match outcome {
            Ok(status) => status,
            Err(Some(Control::Terminate(done_tx))) => {
                done = Some(done_tx);
                self.terminate(generation, &mut child).await
            }
            Err(Some(Control::Kill)) => {
                warn!(generation, "Killing worker process");
                let _ = child.start_kill();
                child.wait().await
            }
            Err(None) => child.wait().await,
        };

        let status = match status {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(generation, error = %e, "Error waiting for worker process");
                None
            }
        };
        self.handle_exit(generation, status);

        if let Some(done_tx) = done {
            let _ = done_tx.send(());
        }
    }

    async fn terminate(&self, generation: u64, child: &mut Child) -> std::io::Result<ExitStatus> {
        let grace_period = self.config.shutdown_grace_period();

        if let Some(pid) = child.id() {
            info!(generation, pid, "Sending SIGTERM to worker");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    generation,
                    grace_period_ms = grace_period.as_millis() as u64,
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.start_kill();
                child.wait().await
            }
        }
    }

    /// Exit path shared by crashes, kills, spawn failures and shutdown
    fn handle_exit(self: &Arc<Self>, generation: u64, status: Option<ExitStatus>) {
        let failed = self.mux.detach_worker(generation);

        let restart = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.pid = None;
            state.running_since = None;
            state.control = None;

            if state.shutting_down {
                state.phase = WorkerPhase::Stopped;
                info!(generation, ?status, failed_requests = failed, "Worker process exited during shutdown");
                return;
            }

            state.phase = WorkerPhase::Exited;
            warn!(
                generation,
                code = ?status.and_then(|s| s.code()),
                ?status,
                failed_requests = failed,
                "Worker process exited unexpectedly"
            );

            match state.policy.next_delay() {
                Some(delay) => {
                    state.phase = WorkerPhase::Restarting;
                    Some((delay, state.policy.attempts(), state.policy.max_restarts()))
                }
                None => None,
            }
        };

        match restart {
            Some((delay, attempt, max_restarts)) => {
                info!(
                    generation,
                    attempt,
                    max_restarts,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling worker restart"
                );
                let supervisor = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    supervisor.launch();
                });
            }
            None => {
                error!(
                    max_restarts = self.config.max_restarts,
                    "Worker restart limit reached, gateway is degraded"
                );
                self.mux.set_unavailable(true);
            }
        }
    }

    /// Reset the restart counter once a generation has stayed up long enough
    fn spawn_stability_timer(self: &Arc<Self>, generation: u64) {
        let supervisor = Arc::clone(self);
        let window = self.config.stable_runtime();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut state = supervisor.state.lock();
            if state.generation == generation
                && state.phase == WorkerPhase::Running
                && state.policy.attempts() > 0
            {
                info!(
                    generation,
                    previous_attempts = state.policy.attempts(),
                    "Worker stable, resetting restart counter"
                );
                state.policy.reset();
            }
        });
    }

    fn spawn_discovery(self: &Arc<Self>, generation: u64) {
        let mux = Arc::clone(&self.mux);
        let delay = self.config.discovery_delay();
        let timeout = self.config.discovery_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            mux.request_discovery(generation);

            let mut wait = timeout;
            loop {
                tokio::time::sleep(wait).await;
                match mux.expire_discovery(generation, timeout) {
                    Some(remaining) => wait = remaining.max(Duration::from_millis(10)),
                    None => break,
                }
            }
        });
    }

    /// Kill the worker when one request has been outstanding for too long
    fn spawn_watchdog(self: &Arc<Self>, timeout: Duration) {
        let supervisor = Arc::clone(self);
        let period = (timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(age) = supervisor.mux.in_flight_age() else {
                    continue;
                };
                if age < timeout {
                    continue;
                }

                let state = supervisor.state.lock();
                if state.shutting_down {
                    return;
                }
                if let Some(control) = &state.control {
                    error!(
                        generation = state.generation,
                        elapsed_ms = age.as_millis() as u64,
                        timeout_ms = timeout.as_millis() as u64,
                        "Worker request timed out, killing worker"
                    );
                    let _ = control.send(Control::Kill);
                }
            }
        });
    }

    fn touch(&self) {
        self.state.lock().last_activity = Some(Instant::now());
    }

    async fn read_stdout(self: Arc<Self>, generation: u64, mut stdout: ChildStdout) {
        let mut framer = LineFramer::default();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(generation, error = %e, "Error reading worker stdout");
                    break;
                }
            };
            self.touch();
            for line in framer.push(&buf[..n]) {
                self.mux.handle_worker_line(generation, &line);
            }
        }
        debug!(generation, pending_bytes = framer.pending_bytes(), "Worker stdout closed");
    }
}

async fn write_stdin(
    generation: u64,
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(mut line) = lines.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!(generation, error = %e, "Failed to write to worker stdin");
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!(generation, error = %e, "Failed to flush worker stdin");
            break;
        }
    }
}

async fn log_stderr(generation: u64, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => {
                warn!(generation, "Worker stderr: {}", line.trim_end());
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                debug!(generation, error = %e, "Error reading worker stderr");
                break;
            }
        }
    }
}
