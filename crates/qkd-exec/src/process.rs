//! Lifecycle wrapper around one long-running external program.
//!
//! A [`ManagedProcess`] owns at most one child at a time. Each child leads its own process group, so
//! teardown reaches every descendant, including ones re-parented after the child exited:
//! graceful terminate, bounded wait, then force-kill whatever survived.
use std::{
    fs::File,
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    process::{Child, ChildStderr, ChildStdin, ChildStdout},
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    error::{ExecError, ExecResult},
    util::{Termination, cmd_program, group_alive, is_alive, process_tree, signal_all, signal_group},
};

/// Called once when a monitored child exits while it was expected to run.
///
/// Receives the exit code, or `None` when the child was killed by a signal.
pub type ExitCallback = Arc<dyn Fn(Option<i32>) + Send + Sync>;

/// Where a child's standard stream goes.
#[derive(Debug, Default)]
pub enum StdioTarget {
    #[default]
    Inherit,
    Null,
    /// Handed back to the caller in [`ChildIo`].
    Piped,
    /// An already-open file, typically a FIFO.
    File(File),
}

impl From<StdioTarget> for Stdio {
    fn from(target: StdioTarget) -> Self {
        match target {
            StdioTarget::Inherit => Stdio::inherit(),
            StdioTarget::Null => Stdio::null(),
            StdioTarget::Piped => Stdio::piped(),
            StdioTarget::File(f) => Stdio::from(f),
        }
    }
}

/// Program, arguments and stream redirections for one start.
#[derive(Debug, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdin: StdioTarget,
    pub stdout: StdioTarget,
    pub stderr: StdioTarget,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Default::default()
        }
    }

    pub fn stdin(mut self, target: StdioTarget) -> Self {
        self.stdin = target;
        self
    }

    pub fn stdout(mut self, target: StdioTarget) -> Self {
        self.stdout = target;
        self
    }

    pub fn stderr(mut self, target: StdioTarget) -> Self {
        self.stderr = target;
        self
    }
}

/// Piped streams of a freshly started child.
#[derive(Debug, Default)]
pub struct ChildIo {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Liveness probe timing for the exit monitor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Delay before the first liveness check.
    pub grace: Duration,
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            interval: Duration::from_secs(2),
        }
    }
}

/// Shared "the owner wants this process alive" flag.
///
/// Readers attached to the process use it as their termination predicate.
#[derive(Debug, Clone, Default)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new(alive: bool) -> Self {
        Self(Arc::new(AtomicBool::new(alive)))
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, alive: bool) {
        self.0.store(alive, Ordering::Release);
    }
}

pub struct ManagedProcess {
    name: String,
    child: Arc<Mutex<Option<Child>>>,
    /// Process group led by the current child.
    group: Option<u32>,
    expected: Liveness,
    monitor_cfg: MonitorConfig,
    monitor: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ManagedProcess {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            child: Arc::new(Mutex::new(None)),
            group: None,
            expected: Liveness::new(false),
            monitor_cfg: MonitorConfig::default(),
            monitor: None,
        }
    }

    pub fn with_monitor_config(mut self, cfg: MonitorConfig) -> Self {
        self.monitor_cfg = cfg;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flag that stays `true` from `start` until `stop` or a detected exit.
    pub fn liveness(&self) -> Liveness {
        self.expected.clone()
    }

    /// Spawn the child.
    ///
    /// Fails with [`ExecError::AlreadyRunning`] while a previous child is still alive.
    /// With `on_exit`, a monitor task reports the first unexpected exit exactly once.
    pub async fn start(
        &mut self,
        spec: ProcessSpec,
        on_exit: Option<ExitCallback>,
    ) -> ExecResult<ChildIo> {
        if spec.program.trim().is_empty() {
            return Err(ExecError::MissingProgram);
        }

        let mut slot = self.child.lock().await;
        if let Some(existing) = slot.as_mut() {
            match existing.try_wait() {
                Ok(None) => {
                    return Err(ExecError::AlreadyRunning {
                        name: self.name.clone(),
                    });
                }
                _ => {
                    trace!(target: "qkd.exec.process", name = %self.name, "reaping exited child before restart");
                    *slot = None;
                }
            }
        }

        let mut cmd = cmd_program(&spec.program, &spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::from(spec.stdin))
            .stdout(Stdio::from(spec.stdout))
            .stderr(Stdio::from(spec.stderr))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(target: "qkd.exec.process", name = %self.name, program = %spec.program, args = ?spec.args, "spawn");
        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("{}: {e}", spec.program)))?;

        let io = ChildIo {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };
        self.group = child.id();
        *slot = Some(child);
        drop(slot);

        self.expected.set(true);
        if let Some(cb) = on_exit {
            self.spawn_monitor(cb);
        }
        Ok(io)
    }

    fn spawn_monitor(&mut self, on_exit: ExitCallback) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let child = Arc::clone(&self.child);
        let expected = self.expected.clone();
        let cfg = self.monitor_cfg;
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(cfg.grace) => {}
            }
            loop {
                let status = {
                    let mut slot = child.lock().await;
                    match slot.as_mut() {
                        None => return,
                        Some(c) => c.try_wait(),
                    }
                };
                match status {
                    Ok(Some(st)) => {
                        if expected.is_alive() {
                            expected.set(false);
                            warn!(target: "qkd.exec.process", %name, code = ?st.code(), "process exited unexpectedly");
                            on_exit(st.code());
                        }
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(target: "qkd.exec.process", %name, error = %e, "liveness check failed");
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep(cfg.interval) => {}
                }
            }
        });
        self.monitor = Some((cancel, handle));
    }

    /// Returns `true` if a child exists and has not exited.
    pub async fn is_running(&self) -> bool {
        let mut slot = self.child.lock().await;
        match slot.as_mut() {
            Some(c) => matches!(c.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }

    /// Terminate the child and its descendants.
    ///
    /// Always leaves the wrapper empty so a later [`start`](Self::start) is legal.
    pub async fn stop(&mut self, timeout: Duration) {
        self.expected.set(false);
        if let Some((cancel, handle)) = self.monitor.take() {
            cancel.cancel();
            let _ = handle.await;
        }

        let group = self.group.take();
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        // An exited child no longer parents its background jobs; only the group still reaches them.
        let exited = matches!(child.try_wait(), Ok(Some(_)));
        let tree = if exited {
            trace!(target: "qkd.exec.process", name = %self.name, "already exited; sweeping group");
            Vec::new()
        } else {
            child.id().map(process_tree).unwrap_or_default()
        };
        debug!(target: "qkd.exec.process", name = %self.name, pgid = ?group, pids = ?tree, "terminating process tree");
        if let Some(pgid) = group {
            signal_group(pgid, Termination::Graceful);
        }
        signal_all(&tree, Termination::Graceful);

        let deadline = Instant::now() + timeout;
        if !exited && tokio::time::timeout_at(deadline, child.wait()).await.is_err() {
            warn!(target: "qkd.exec.process", name = %self.name, "graceful stop timed out; killing");
            let _ = child.start_kill();
        }
        let _ = child.wait().await;

        // Descendants may outlive the parent; give them the rest of the window.
        let mut survivors: Vec<u32> = tree.iter().skip(1).copied().filter(|p| is_alive(*p)).collect();
        let mut group = group.filter(|g| group_alive(*g));
        while (!survivors.is_empty() || group.is_some()) && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
            survivors.retain(|p| is_alive(*p));
            group = group.filter(|g| group_alive(*g));
        }
        if let Some(pgid) = group {
            warn!(target: "qkd.exec.process", name = %self.name, pgid, "force-killing process group");
            signal_group(pgid, Termination::Force);
        }
        if !survivors.is_empty() {
            warn!(target: "qkd.exec.process", name = %self.name, pids = ?survivors, "force-killing survivors");
            signal_all(&survivors, Termination::Force);
        }
    }
}
