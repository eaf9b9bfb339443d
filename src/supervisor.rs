//! Run orchestration: spawn the child, coordinate the output drain and the
//! tree sampler, handle cancellation, reconcile leaks, and emit exactly one
//! [`RunResult`].
//!
//! Lifecycle per run: `Idle → Launching → Running → {Completed | Cancelled |
//! LaunchFailed}`. The supervisor exclusively owns the child handle; the
//! drain readers and the sampler only ever see the pipe ends and the PID,
//! and report back over channels the supervisor alone consumes.

use crate::config::WatchConfig;
use crate::drain::{self, OutputEvent, OutputKind, StreamTag};
use crate::environment;
use crate::launch::LaunchSpec;
use crate::sampler::{self, Sample};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Bound on waiting for the OS to reap an exited child before escalating.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on waiting for the sampler task to hand back the tracked PID set.
const SAMPLER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Asynchronous cancellation signal. Cloneable, idempotent: the first
/// `cancel()` wins, later calls are no-ops.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    stop: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                stop: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Request cancellation. Safe to call from any task, any number of times.
    pub fn cancel(&self) {
        if !self.inner.stop.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One in-flight supervised run. Exclusively owned by the supervisor; the
/// PID and timestamps are shared with collaborators by value only.
#[derive(Debug)]
pub struct RunHandle {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    started: Instant,
    live: bool,
}

impl RunHandle {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            started_at: Utc::now(),
            started: Instant::now(),
            live: true,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }
}

/// Events pushed to the caller while a run is in flight.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// The child process started.
    Started { pid: u32 },
    /// One resource-usage tick across the process tree.
    Sample(Sample),
    /// One line of child output, or a stream-closed sentinel.
    Output(OutputEvent),
    /// Free-text diagnostic line (resolved interpreter, command line, ...).
    Log(String),
}

/// Why a run never got off the ground.
#[derive(Debug)]
pub enum LaunchError {
    /// The interpreter path does not name an executable file.
    InterpreterNotFound { path: PathBuf },
    /// The OS refused to start the process.
    Spawn { source: std::io::Error },
    /// The process died before a PID could be obtained.
    ExitedImmediately,
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::InterpreterNotFound { path } => {
                write!(f, "python interpreter not found: {}", path.display())
            }
            LaunchError::Spawn { source } => {
                write!(f, "failed to spawn interpreter: {}", source)
            }
            LaunchError::ExitedImmediately => {
                write!(f, "process exited immediately after launch")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn { source } => Some(source),
            _ => None,
        }
    }
}

/// Terminal record of a run. Produced exactly once per run.
#[derive(Debug)]
pub enum RunResult {
    /// The process never started; nothing was sampled or drained.
    LaunchFailed { error: LaunchError },
    /// The process ran and was reaped (naturally or via cancellation).
    Completed {
        pid: u32,
        /// `None` when the child was killed by a signal.
        exit_code: Option<i32>,
        duration: Duration,
        /// Human-readable descriptors of tracked PIDs still alive after the
        /// reconciliation grace period.
        leaked: Vec<String>,
        /// Accumulated stdout, line order preserved.
        stdout: String,
        /// Accumulated stderr, line order preserved.
        stderr: String,
    },
}

impl RunResult {
    /// Exit code for interface boundaries: the child's own code, or `-1`
    /// when the run never produced one (launch failure, killed by signal).
    pub fn exit_code(&self) -> i32 {
        match self {
            RunResult::Completed {
                exit_code: Some(code),
                ..
            } => *code,
            _ => -1,
        }
    }

    pub fn is_launch_failure(&self) -> bool {
        matches!(self, RunResult::LaunchFailed { .. })
    }
}

/// Orchestrates one supervised run at a time. The interpreter is an injected
/// value — resolve it once via [`crate::resolver::resolve`] and construct a
/// new supervisor (or call `resolve` again) to refresh it.
pub struct Supervisor {
    interpreter: PathBuf,
    sample_interval: Duration,
    zombie_grace: Duration,
    drain_join_timeout: Duration,
}

impl Supervisor {
    pub fn new(interpreter: PathBuf) -> Self {
        Self::with_config(interpreter, &WatchConfig::default())
    }

    pub fn with_config(interpreter: PathBuf, config: &WatchConfig) -> Self {
        Self {
            interpreter,
            sample_interval: Duration::from_millis(config.sampler.interval_ms),
            zombie_grace: Duration::from_millis(config.reconcile.grace_ms),
            drain_join_timeout: Duration::from_millis(config.drain.join_timeout_ms),
        }
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    /// Run `spec` to completion (or cancellation), pushing [`RunEvent`]s to
    /// `events` along the way. Returns the single terminal [`RunResult`].
    pub async fn run(
        &self,
        spec: &LaunchSpec,
        events: &UnboundedSender<RunEvent>,
        cancel: CancelToken,
    ) -> RunResult {
        let env = environment::build_env(spec);

        let command_line = self.render_command_line(spec);
        emit(events, RunEvent::Log(format!("python: {}", self.interpreter.display())));
        emit(events, RunEvent::Log(format!("cwd: {}", spec.cwd.display())));
        emit(events, RunEvent::Log(format!("cmd: {command_line}")));
        let pythonpath = env
            .get(OsStr::new("PYTHONPATH"))
            .map(|v| v.to_string_lossy().into_owned())
            .unwrap_or_default();
        emit(
            events,
            RunEvent::Log(format!("pythonpath: {}", preview(&pythonpath, 280))),
        );
        info!(
            interpreter = %self.interpreter.display(),
            cwd = %spec.cwd.display(),
            "launching supervised run"
        );

        // -u = unbuffered, so output lines arrive as the target writes them.
        let mut command = Command::new(&self.interpreter);
        command
            .arg("-u")
            .arg(&spec.script)
            .args(&spec.extra_args)
            .current_dir(&spec.cwd)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0); // New process group for clean tree kill

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return RunResult::LaunchFailed {
                    error: LaunchError::InterpreterNotFound {
                        path: self.interpreter.clone(),
                    },
                };
            }
            Err(e) => {
                return RunResult::LaunchFailed {
                    error: LaunchError::Spawn { source: e },
                };
            }
        };

        let Some(pid) = child.id() else {
            let _ = child.wait().await;
            return RunResult::LaunchFailed {
                error: LaunchError::ExitedImmediately,
            };
        };
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return RunResult::LaunchFailed {
                error: LaunchError::ExitedImmediately,
            };
        };

        let mut handle = RunHandle::new(pid);
        info!(pid, started_at = %handle.started_at, "child started");
        emit(events, RunEvent::Started { pid });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut reader_out = drain::spawn_reader(stdout, StreamTag::Out, out_tx.clone());
        let mut reader_err = drain::spawn_reader(stderr, StreamTag::Err, out_tx);

        let (sample_tx, mut sample_rx) = mpsc::unbounded_channel();
        let sampler_stop = CancelToken::new();
        let mut sampler_task = sampler::spawn_sampler(
            pid,
            handle.started,
            self.sample_interval,
            sample_tx,
            sampler_stop.clone(),
        );

        let mut stdout_text = String::new();
        let mut stderr_text = String::new();
        let mut open_streams = 2u8;
        let mut killed = false;
        let mut exit_status = None;

        // Wait loop: child exit, output, samples and cancellation all arrive
        // here; nothing else mutates the child handle.
        while open_streams > 0 && exit_status.is_none() {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => exit_status = Some(status),
                        Err(e) => {
                            warn!(error = %e, "wait on child failed");
                            break;
                        }
                    }
                }
                maybe_event = out_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            accumulate(&event, &mut stdout_text, &mut stderr_text);
                            if matches!(event.kind, OutputKind::Closed) {
                                open_streams -= 1;
                            }
                            emit(events, RunEvent::Output(event));
                        }
                        None => break,
                    }
                }
                Some(sample) = sample_rx.recv() => {
                    emit(events, RunEvent::Sample(sample));
                }
                _ = cancel.cancelled(), if !killed => {
                    killed = true;
                    emit(events, RunEvent::Log("terminating process tree".to_string()));
                    sampler_stop.cancel();
                    kill_tree(pid, &mut child);
                }
            }
        }

        // The child may outlive its streams (it can close them and keep
        // running); keep forwarding samples and honoring cancellation while
        // waiting for it.
        let exit_status = match exit_status {
            Some(status) => Some(status),
            None if killed => bounded_reap(&mut child).await,
            None => loop {
                tokio::select! {
                    status = child.wait() => break status.ok(),
                    Some(sample) = sample_rx.recv() => {
                        emit(events, RunEvent::Sample(sample));
                    }
                    _ = cancel.cancelled(), if !killed => {
                        killed = true;
                        emit(events, RunEvent::Log("terminating process tree".to_string()));
                        sampler_stop.cancel();
                        kill_tree(pid, &mut child);
                        break bounded_reap(&mut child).await;
                    }
                }
            },
        };

        // Join both readers with a bound: a leaked descendant can inherit
        // the pipe and hold it open long after the child is gone.
        for (tag, task) in [
            (StreamTag::Out, &mut reader_out),
            (StreamTag::Err, &mut reader_err),
        ] {
            if timeout(self.drain_join_timeout, &mut *task).await.is_err() {
                warn!(stream = %tag, "output reader still blocked, abandoning it");
                task.abort();
            }
        }
        // Everything the readers managed to deliver is kept, even on a
        // timed-out join.
        while let Ok(event) = out_rx.try_recv() {
            accumulate(&event, &mut stdout_text, &mut stderr_text);
            emit(events, RunEvent::Output(event));
        }

        sampler_stop.cancel();
        let tracked = match timeout(SAMPLER_JOIN_TIMEOUT, &mut sampler_task).await {
            Ok(Ok(tracked)) => tracked,
            Ok(Err(e)) => {
                warn!(error = %e, "sampler task failed");
                HashSet::from([pid])
            }
            Err(_) => {
                warn!("sampler task did not stop in time");
                sampler_task.abort();
                HashSet::from([pid])
            }
        };
        // Flush queued samples before the terminal result: no Sample is ever
        // delivered after the RunResult.
        while let Ok(sample) = sample_rx.try_recv() {
            emit(events, RunEvent::Sample(sample));
        }

        let leaked = reconcile(&tracked, self.zombie_grace).await;
        handle.live = false;

        let exit_code = exit_status.and_then(|status| status.code());
        let duration = handle.started.elapsed();
        info!(
            pid,
            exit_code = ?exit_code,
            duration_secs = duration.as_secs_f64(),
            leaked = leaked.len(),
            cancelled = killed,
            "run finished"
        );
        RunResult::Completed {
            pid,
            exit_code,
            duration,
            leaked,
            stdout: stdout_text,
            stderr: stderr_text,
        }
    }

    fn render_command_line(&self, spec: &LaunchSpec) -> String {
        let mut parts: Vec<String> = vec![
            self.interpreter.to_string_lossy().into_owned(),
            "-u".to_string(),
            spec.script.to_string_lossy().into_owned(),
        ];
        parts.extend(spec.extra_args.iter().cloned());
        shell_words::join(&parts)
    }
}

fn emit(events: &UnboundedSender<RunEvent>, event: RunEvent) {
    // A caller that dropped its receiver forfeits the stream, nothing more.
    let _ = events.send(event);
}

fn accumulate(event: &OutputEvent, stdout_text: &mut String, stderr_text: &mut String) {
    if let OutputKind::Line(line) = &event.kind {
        let sink = match event.stream {
            StreamTag::Out => stdout_text,
            StreamTag::Err => stderr_text,
        };
        sink.push_str(line);
        sink.push('\n');
    }
}

/// Forcibly kill the tree rooted at `pid`: enumerable descendants first (to
/// minimize orphaning), then the child itself, then (Unix) a process-group
/// sweep for anything the scan raced against.
fn kill_tree(pid: u32, child: &mut Child) {
    let root = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    for descendant in sampler::descendants_of(&system, root) {
        if let Some(proc) = system.process(descendant) {
            debug!(pid = descendant.as_u32(), "killing descendant");
            proc.kill();
        }
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid as NixPid;
        let _ = killpg(NixPid::from_raw(pid as i32), Signal::SIGKILL);
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "child already gone");
    }
}

/// Wait for the child to be reaped, escalating to a kill if the bound
/// elapses (e.g. the process ignored everything so far).
async fn bounded_reap(child: &mut Child) -> Option<std::process::ExitStatus> {
    match timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(result) => result.ok(),
        Err(_) => {
            let _ = child.start_kill();
            match timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(result) => result.ok(),
                Err(_) => {
                    warn!("child could not be reaped");
                    None
                }
            }
        }
    }
}

/// Leak scan: after a grace period for OS teardown, report every tracked PID
/// that still exists and is not a zombie awaiting reap. Reporting only — no
/// re-kill happens here.
pub async fn reconcile(tracked: &HashSet<u32>, grace: Duration) -> Vec<String> {
    tokio::time::sleep(grace).await;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut pids: Vec<u32> = tracked.iter().copied().collect();
    pids.sort_unstable();

    let mut leaked = Vec::new();
    for pid in pids {
        let Some(proc) = system.process(Pid::from_u32(pid)) else {
            continue;
        };
        if proc.status() != ProcessStatus::Zombie {
            leaked.push(format!("PID {pid} ({})", proc.name().to_string_lossy()));
        }
    }
    leaked
}

/// Truncate to `max_chars`, marking elision. Diagnostic previews only.
fn preview(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        let truncated: String = value.chars().take(max_chars).collect();
        format!("{truncated}…")
    }
}
