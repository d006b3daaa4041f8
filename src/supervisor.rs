//! Lifecycle of the single hosted instance.
//!
//! A run moves through `Spawning -> WaitingForSignal -> Ready`, or ends early
//! in a failure. Every run gets its own monitor task that owns the child
//! process and consumes events (output chunks, kill requests, the startup
//! deadline, process exit) one at a time. All supervisor state lives behind
//! one mutex and is only mutated in short critical sections, never across an
//! await.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

use crate::config::SupervisorConfig;
use crate::descriptor::{PackageJsonChecker, PluginDescriptorChecker};
use crate::error::{Result, SupervisorError};
use crate::logging::OUTPUT_TARGET;
use crate::output::{OutputLine, OutputLog, OutputStream};
use crate::port::{validate_port, PortProbe, TcpPortProbe};
use crate::process::{build_launch_spec, InspectOptions, ProcessHost, TokioProcessHost};
use crate::readiness::{LineBuffer, StartupScanner};

const READ_CHUNK_BYTES: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Per-run launch options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Suggested listen port. `None` uses the configured default.
    pub port: Option<u32>,
    /// Open the plugin host inspector for debugging.
    pub inspect: Option<InspectOptions>,
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub running: bool,
    /// Generation of the current or most recent run; 0 before the first run.
    pub run_id: u64,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    /// Only set once the instance reported readiness.
    pub endpoint: Option<Url>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RunState {
    running: bool,
    generation: u64,
    port: Option<u16>,
    pid: Option<u32>,
    endpoint: Option<Url>,
    kill_tx: Option<mpsc::UnboundedSender<()>>,
}

struct Inner {
    run: RunState,
    output: OutputLog,
}

struct Shared {
    inner: Mutex<Inner>,
    running_tx: watch::Sender<bool>,
}

impl Shared {
    fn new(output_capacity: usize) -> Self {
        let (running_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                run: RunState::default(),
                output: OutputLog::new(output_capacity),
            }),
            running_tx,
        }
    }

    /// Mark the slot running for a new generation. The kill receiver is handed
    /// out now so a `terminate()` issued before spawn is not lost.
    fn claim(&self) -> Result<(u64, mpsc::UnboundedReceiver<()>)> {
        let mut inner = self.inner.lock();
        if inner.run.running {
            return Err(SupervisorError::AlreadyRunning);
        }
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let generation = inner.run.generation + 1;
        inner.run = RunState {
            running: true,
            generation,
            kill_tx: Some(kill_tx),
            ..RunState::default()
        };
        inner.output.clear();
        self.running_tx.send_replace(true);
        Ok((generation, kill_rx))
    }

    /// Leave the running state, unless a newer run already owns the slot.
    fn finish(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.run.generation != generation || !inner.run.running {
            return;
        }
        inner.run.running = false;
        inner.run.kill_tx = None;
        self.running_tx.send_replace(false);
    }

    fn update(&self, generation: u64, apply: impl FnOnce(&mut RunState)) {
        let mut inner = self.inner.lock();
        if inner.run.generation == generation && inner.run.running {
            apply(&mut inner.run);
        }
    }

    fn record(&self, generation: u64, stream: OutputStream, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let current = inner.run.generation == generation;
        for line in lines {
            tracing::debug!(target: OUTPUT_TARGET, run_id = generation, ?stream, "{line}");
            if current {
                inner.output.push(stream, line);
            }
        }
    }
}

/// Releases a claimed slot on drop unless the run reached its monitor.
struct SlotClaim {
    shared: Arc<Shared>,
    generation: u64,
    armed: bool,
}

impl SlotClaim {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        if self.armed {
            self.shared.finish(self.generation);
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns at most one hosted instance at a time.
///
/// Independent supervisors do not coordinate; share one instance (e.g. behind
/// an `Arc`) where process-wide uniqueness is required.
pub struct InstanceSupervisor<P = TcpPortProbe, H = TokioProcessHost> {
    config: SupervisorConfig,
    probe: P,
    host: H,
    checker: Box<dyn PluginDescriptorChecker>,
    shared: Arc<Shared>,
}

impl InstanceSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_collaborators(config, TcpPortProbe, TokioProcessHost, PackageJsonChecker)
    }
}

impl Default for InstanceSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl<P: PortProbe, H: ProcessHost> InstanceSupervisor<P, H> {
    pub fn with_collaborators(
        config: SupervisorConfig,
        probe: P,
        host: H,
        checker: impl PluginDescriptorChecker + 'static,
    ) -> Self {
        let shared = Arc::new(Shared::new(config.output_log_lines));
        Self {
            config,
            probe,
            host,
            checker: Box::new(checker),
            shared,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start an instance hosting the plugin at `location` and wait until it
    /// reports the address it listens on.
    pub async fn run(&self, location: &Url, suggested_port: Option<u32>) -> Result<Url> {
        self.run_with(
            location,
            RunOptions {
                port: suggested_port,
                inspect: None,
            },
        )
        .await
    }

    /// [`run`](Self::run) with debugging and other per-run options.
    pub async fn run_with(&self, location: &Url, options: RunOptions) -> Result<Url> {
        if self.is_running() {
            return Err(SupervisorError::AlreadyRunning);
        }
        let plugin_dir = local_path(location)?;
        let port = validate_port(
            options
                .port
                .unwrap_or_else(|| u32::from(self.config.default_port)),
        )?;

        let (generation, mut kill_rx) = self.shared.claim()?;
        let claim = SlotClaim {
            shared: self.shared.clone(),
            generation,
            armed: true,
        };

        if !self.probe.is_port_free(port).await {
            tracing::info!(run_id = generation, port, "port is busy, not starting instance");
            return Err(SupervisorError::PortInUse(port));
        }
        if kill_rx.try_recv().is_ok() {
            tracing::info!(run_id = generation, port, "terminated while probing port, not starting instance");
            return Err(SupervisorError::TerminatedBeforeSpawn);
        }

        let spec = build_launch_spec(
            &self.config,
            port,
            &plugin_dir,
            options.inspect,
            std::env::vars_os(),
        )
        .map_err(SupervisorError::Spawn)?;

        tracing::info!(
            run_id = generation,
            port,
            program = %spec.program.display(),
            location = %plugin_dir.display(),
            "starting hosted instance"
        );
        let mut child = self.host.spawn(&spec).map_err(|e| {
            tracing::warn!(run_id = generation, "failed to spawn hosted instance: {e}");
            SupervisorError::Spawn(e)
        })?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.start_kill();
            return Err(SupervisorError::Spawn(std::io::Error::other(
                "hosted instance stdout is not piped",
            )));
        };
        let pid = child.id();
        self.shared.update(generation, |run| {
            run.port = Some(port);
            run.pid = pid;
        });

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(
                self.shared.clone(),
                generation,
                OutputStream::Stderr,
                stderr,
            ));
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let monitor = Monitor {
            shared: self.shared.clone(),
            generation,
            child,
            stdout,
            kill_rx,
            timeout: self.config.startup_timeout(),
        };
        tokio::spawn(monitor.supervise(ready_tx));
        // From here the monitor owns every transition of this run.
        claim.disarm();

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::ExitedBeforeReady(
                "instance monitor stopped unexpectedly".to_string(),
            )),
        }
    }

    /// Force-kill the running instance.
    ///
    /// Returns once the kill is requested; [`is_running`](Self::is_running)
    /// turns false only after the exit is observed. Use
    /// [`wait_for_exit`](Self::wait_for_exit) to wait for that.
    pub fn terminate(&self) -> Result<()> {
        let inner = self.shared.inner.lock();
        if !inner.run.running {
            return Err(SupervisorError::NotRunning);
        }
        tracing::info!(run_id = inner.run.generation, pid = ?inner.run.pid, "terminating hosted instance");
        if let Some(kill_tx) = &inner.run.kill_tx {
            // A closed channel means the monitor is already tearing down.
            let _ = kill_tx.send(());
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.inner.lock().run.running
    }

    /// Address the running instance reported at startup.
    pub fn instance_endpoint(&self) -> Result<Url> {
        let inner = self.shared.inner.lock();
        match (&inner.run.endpoint, inner.run.running) {
            (Some(endpoint), true) => Ok(endpoint.clone()),
            _ => Err(SupervisorError::NotRunning),
        }
    }

    pub fn listen_port(&self) -> Result<u16> {
        let inner = self.shared.inner.lock();
        match (inner.run.port, inner.run.running) {
            (Some(port), true) => Ok(port),
            _ => Err(SupervisorError::NotRunning),
        }
    }

    pub fn status(&self) -> InstanceStatus {
        let inner = self.shared.inner.lock();
        InstanceStatus {
            running: inner.run.running,
            run_id: inner.run.generation,
            port: inner.run.port,
            pid: inner.run.pid,
            endpoint: inner.run.endpoint.clone(),
        }
    }

    /// Latest output lines of the current or last run, oldest first.
    /// A `limit` of 0 returns everything retained.
    pub fn recent_output(&self, limit: usize) -> Vec<OutputLine> {
        self.shared.inner.lock().output.recent(limit)
    }

    /// Resolve once no instance is running.
    pub async fn wait_for_exit(&self) {
        let mut running = self.shared.running_tx.subscribe();
        // The sender lives as long as `self`, so this only ends on `false`.
        let _ = running.wait_for(|running| !*running).await;
    }

    /// Whether `location` holds a plugin the instance can host. Never fails.
    pub fn is_valid_plugin(&self, location: &Url) -> bool {
        match local_path(location) {
            Ok(dir) => self.checker.is_valid_plugin(&dir),
            Err(_) => false,
        }
    }
}

impl<P, H> Drop for InstanceSupervisor<P, H> {
    fn drop(&mut self) {
        let inner = self.shared.inner.lock();
        if inner.run.running
            && let Some(kill_tx) = &inner.run.kill_tx
        {
            let _ = kill_tx.send(());
        }
    }
}

/// Only `file:` locations naming a local path can be hosted.
fn local_path(location: &Url) -> Result<std::path::PathBuf> {
    if location.scheme() != "file" {
        return Err(SupervisorError::UnsupportedLocation(location.to_string()));
    }
    location
        .to_file_path()
        .map_err(|()| SupervisorError::UnsupportedLocation(location.to_string()))
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

/// How the `WaitingForSignal` phase ended.
enum Startup {
    Ready(Url),
    /// Process exited on its own (or after `terminate`) before readiness.
    Exited(String),
    /// Timeout or unusable address; the process is still alive.
    Failed(SupervisorError),
    /// The `run()` caller went away.
    Abandoned,
}

struct Monitor {
    shared: Arc<Shared>,
    generation: u64,
    child: Child,
    stdout: ChildStdout,
    kill_rx: mpsc::UnboundedReceiver<()>,
    timeout: Duration,
}

impl Monitor {
    async fn supervise(self, mut ready_tx: oneshot::Sender<Result<Url>>) {
        let Monitor {
            shared,
            generation,
            mut child,
            mut stdout,
            mut kill_rx,
            timeout,
        } = self;

        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        let mut stdout_open = true;
        let mut scanner = StartupScanner::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let startup = loop {
            tokio::select! {
                biased;
                Some(()) = kill_rx.recv() => request_kill(&mut child, generation),
                read = stdout.read(&mut buf), if stdout_open => {
                    let scan = match read {
                        Ok(n) if n > 0 => scanner.push(&buf[..n]),
                        _ => {
                            stdout_open = false;
                            scanner.finish()
                        }
                    };
                    shared.record(generation, OutputStream::Stdout, scan.lines);
                    if let Some(address) = scan.address {
                        break match Url::parse(&address) {
                            Ok(endpoint) => Startup::Ready(endpoint),
                            Err(reason) => Startup::Failed(SupervisorError::InvalidEndpoint {
                                address,
                                reason,
                            }),
                        };
                    }
                }
                status = child.wait() => break Startup::Exited(describe_exit(status)),
                () = &mut deadline => break Startup::Failed(SupervisorError::StartupTimeout(timeout)),
                () = ready_tx.closed() => break Startup::Abandoned,
            }
        };

        let endpoint = match startup {
            Startup::Ready(endpoint) => endpoint,
            Startup::Exited(detail) => {
                tracing::warn!(run_id = generation, "hosted instance exited before ready: {detail}");
                shared.finish(generation);
                let _ = ready_tx.send(Err(SupervisorError::ExitedBeforeReady(detail)));
                return;
            }
            Startup::Failed(err) => {
                tracing::warn!(run_id = generation, "hosted instance failed to start: {err}");
                kill_and_reap(&mut child, generation).await;
                shared.finish(generation);
                let _ = ready_tx.send(Err(err));
                return;
            }
            Startup::Abandoned => {
                tracing::info!(run_id = generation, "run abandoned before ready, stopping instance");
                kill_and_reap(&mut child, generation).await;
                shared.finish(generation);
                return;
            }
        };

        tracing::info!(run_id = generation, %endpoint, "hosted instance ready");
        shared.update(generation, |run| run.endpoint = Some(endpoint.clone()));
        if ready_tx.send(Ok(endpoint)).is_err() {
            tracing::info!(run_id = generation, "run abandoned at readiness, stopping instance");
            kill_and_reap(&mut child, generation).await;
            shared.finish(generation);
            return;
        }

        // Ready: keep draining stdout so the child never blocks on a full
        // pipe, but stop scanning for the signature.
        let mut lines: LineBuffer = scanner.into_lines();
        let status = loop {
            tokio::select! {
                biased;
                Some(()) = kill_rx.recv() => request_kill(&mut child, generation),
                read = stdout.read(&mut buf), if stdout_open => {
                    let completed = match read {
                        Ok(n) if n > 0 => lines.push(&buf[..n]),
                        _ => {
                            stdout_open = false;
                            lines.finish().into_iter().collect()
                        }
                    };
                    shared.record(generation, OutputStream::Stdout, completed);
                }
                status = child.wait() => break describe_exit(status),
            }
        };
        tracing::info!(run_id = generation, "hosted instance stopped: {status}");
        shared.finish(generation);
    }
}

fn request_kill(child: &mut Child, generation: u64) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(run_id = generation, "kill request failed: {e}");
    }
}

async fn kill_and_reap(child: &mut Child, generation: u64) {
    if let Err(e) = child.kill().await {
        tracing::debug!(run_id = generation, "kill failed: {e}");
    }
}

fn describe_exit(status: std::io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    }
}

/// Forward a secondary output stream into the log until it closes.
async fn forward_output(
    shared: Arc<Shared>,
    generation: u64,
    stream: OutputStream,
    mut reader: impl AsyncRead + Unpin,
) {
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut lines = LineBuffer::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(n) if n > 0 => shared.record(generation, stream, lines.push(&buf[..n])),
            _ => break,
        }
    }
    shared.record(generation, stream, lines.finish().into_iter().collect());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
