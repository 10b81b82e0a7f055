use std::{future::Future, sync::Arc, time::Duration};

use qkd_exec::prelude::*;
use qkd_model::{Epoch, LinkConfig, LinkEvent, ProtocolMode, RestartReason, Subsystem};
use tokio::{
    io::AsyncWrite,
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::health::{Heartbeat, RestartTrigger, spawn_silence_watch};
use crate::{
    error::CoreResult,
    layout::{DataRoot, Fifo},
    policy::FaultPolicy,
    relay::RelayTaps,
    state::StatusBoard,
};

/// Shared resources every stage is started with.
#[derive(Clone)]
pub struct StageContext {
    pub cfg: Arc<LinkConfig>,
    pub layout: DataRoot,
    pub events: mpsc::UnboundedSender<LinkEvent>,
    pub taps: RelayTaps,
    pub board: StatusBoard,
    /// Decides which faults a stage absorbs itself.
    pub policy: FaultPolicy,
}

impl StageContext {
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.cfg.health.pipe_poll_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.health.stop_timeout_ms)
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            grace: Duration::from_millis(self.cfg.health.monitor_grace_ms),
            interval: Duration::from_millis(self.cfg.health.monitor_interval_ms),
        }
    }

    /// Longest tolerated gap between two log lines of a running stage.
    pub fn silence_limit(&self, mode: ProtocolMode) -> Duration {
        Duration::from_secs(match mode {
            ProtocolMode::Keygen => self.cfg.health.silence_keygen_secs,
            ProtocolMode::Service => self.cfg.health.silence_service_secs,
        })
    }

    pub fn path(&self, fifo: Fifo) -> String {
        self.layout.fifo(fifo).display().to_string()
    }
}

/// One external program plus the channels and helper tasks of a single run.
pub(crate) struct StageRuntime {
    subsystem: Subsystem,
    process: ManagedProcess,
    channels: Vec<PipeChannel>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    trigger: Option<RestartTrigger>,
}

impl StageRuntime {
    pub(crate) fn new(subsystem: Subsystem, ctx: &StageContext) -> Self {
        Self {
            subsystem,
            process: ManagedProcess::new(subsystem.as_str()).with_monitor_config(ctx.monitor()),
            channels: Vec::new(),
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
            trigger: None,
        }
    }

    pub(crate) fn liveness(&self) -> Liveness {
        self.process.liveness()
    }

    /// Arm a fresh trigger for the next run; must precede `open_log` and `launch`.
    pub(crate) fn arm(&mut self, ctx: &StageContext) -> RestartTrigger {
        let trigger = RestartTrigger::new(self.subsystem, ctx.events.clone());
        self.cancel = CancellationToken::new();
        self.trigger = Some(trigger.clone());
        trigger
    }

    /// Attach a reader to a FIFO the program writes; opened before the program starts.
    pub(crate) fn open_log<F>(&mut self, ctx: &StageContext, fifo: Fifo, callback: F) -> CoreResult<()>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let reader = open_fifo_reader(&ctx.layout.fifo(fifo))?;
        self.channels.push(PipeChannel::read(
            reader,
            fifo.file_name(),
            ctx.poll(),
            self.process.liveness(),
            true,
            callback,
        ));
        Ok(())
    }

    /// Start the program; log channels follow its liveness from here on.
    pub(crate) async fn launch(&mut self, spec: ProcessSpec) -> CoreResult<ChildIo> {
        let trigger = self.trigger.clone();
        let on_exit: ExitCallback = Arc::new(move |code| {
            if let Some(t) = &trigger {
                t.fire(RestartReason::ProcessExited { code });
            }
        });
        let io = self.process.start(spec, Some(on_exit)).await?;
        for ch in &self.channels {
            ch.set_persist(false);
        }
        let pid = self.process.pid().await;
        info!(target: "qkd.core.stage", subsystem = %self.subsystem, pid = ?pid, "stage started");
        Ok(io)
    }

    pub(crate) fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(fut));
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn watch_silence(&mut self, heartbeat: Heartbeat, limit: Duration) {
        let Some(trigger) = self.trigger.clone() else {
            return;
        };
        let task = spawn_silence_watch(heartbeat, limit, trigger, self.cancel.clone());
        self.tasks.push(task);
    }

    /// Feed every received partner epoch into the program's command FIFO.
    pub(crate) fn forward_received(&mut self, ctx: &StageContext, fifo: Fifo) -> CoreResult<()> {
        let writer = LineWriter::new(open_fifo_writer(&ctx.layout.fifo(fifo))?);
        let received = ctx.taps.subscribe_received();
        let task = forward_epochs(received, writer, fifo.file_name(), self.cancel.clone());
        self.tasks.push(tokio::spawn(task));
        Ok(())
    }

    pub(crate) fn is_active(&self) -> bool {
        self.trigger.is_some()
    }

    /// Tear down the run. Safe to call on a stage that never started.
    pub(crate) async fn stop(&mut self, timeout: Duration) {
        let Some(trigger) = self.trigger.take() else {
            return;
        };
        trigger.disarm();
        self.cancel.cancel();
        self.process.stop(timeout).await;
        for mut ch in self.channels.drain(..) {
            ch.stop().await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        debug!(target: "qkd.core.stage", subsystem = %self.subsystem, "stage stopped");
    }
}

async fn forward_epochs<W>(
    mut received: broadcast::Receiver<Epoch>,
    mut writer: LineWriter<W>,
    name: &'static str,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let epoch = tokio::select! {
            _ = cancel.cancelled() => break,
            next = received.recv() => match next {
                Ok(epoch) => epoch,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(target: "qkd.core.stage", fifo = name, skipped = n, "received epochs dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        match writer.send_line(&epoch.to_string()).await {
            Ok(()) => trace!(target: "qkd.core.stage", fifo = name, %epoch, "epoch forwarded"),
            Err(e) => warn!(target: "qkd.core.stage", fifo = name, %epoch, error = %e, "could not forward epoch"),
        }
    }
}

/// Parse the `<epoch> <count>` lines both choppers log per finished epoch.
pub fn parse_epoch_count(line: &str) -> Option<(Epoch, u64)> {
    let mut it = line.split_whitespace();
    let epoch = it.next()?.parse().ok()?;
    let count = it.next().map_or(Some(0), |c| c.parse().ok())?;
    Some((epoch, count))
}
