//! Both chopper variants. The low side ships its partner-bound stream via the relay,
//! the high side keeps its own epochs for the matcher and reports progress for synchronization.
use qkd_exec::prelude::*;
use qkd_model::{ProtocolMode, RestartReason, Subsystem};
use tokio::sync::watch;
use tracing::trace;

use super::{
    health::{Heartbeat, ZeroCountMonitor},
    runtime::{StageContext, StageRuntime, parse_epoch_count},
};
use crate::{
    error::CoreResult,
    layout::{Fifo, KeyDir},
    sync::ChopperProgress,
};

pub struct ChopperLow {
    rt: StageRuntime,
}

impl ChopperLow {
    pub fn new(ctx: &StageContext) -> Self {
        Self {
            rt: StageRuntime::new(Subsystem::ChopperLow, ctx),
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.rt.liveness()
    }

    pub async fn start(&mut self, ctx: &StageContext, mode: ProtocolMode) -> CoreResult<()> {
        let trigger = self.rt.arm(ctx);
        let heartbeat = Heartbeat::new();

        let mut zeros = ZeroCountMonitor::new(ctx.cfg.health.zero_count_epochs);
        let taps = ctx.taps.clone();
        let beat = heartbeat.clone();
        self.rt.open_log(ctx, Fifo::T3Log, move |line| {
            let Some((epoch, count)) = parse_epoch_count(line) else {
                trace!(target: "qkd.core.stage", %line, "ignoring t3 log line");
                return;
            };
            beat.touch();
            taps.send_epoch(epoch);
            if let Some(epochs) = zeros.observe(count) {
                trigger.fire(RestartReason::ZeroCounts { epochs });
            }
        })?;

        let dir = |d: KeyDir| ctx.layout.dir(d).display().to_string();
        let args = vec![
            "-i".into(),
            ctx.path(Fifo::RawEvents),
            "-D".into(),
            dir(KeyDir::Send),
            "-d".into(),
            dir(KeyDir::T3),
            "-l".into(),
            ctx.path(Fifo::T3Log),
            "-V".into(),
            "4".into(),
            "-U".into(),
            "-F".into(),
        ];
        let spec = ProcessSpec::new(ctx.cfg.programs.chopper_low.clone(), args).stdin(StdioTarget::Null);
        self.rt.launch(spec).await?;
        heartbeat.touch();
        self.rt.watch_silence(heartbeat, ctx.silence_limit(mode));
        Ok(())
    }

    pub async fn stop(&mut self, ctx: &StageContext) {
        self.rt.stop(ctx.stop_timeout()).await;
    }
}

pub struct ChopperHigh {
    rt: StageRuntime,
    progress: watch::Sender<ChopperProgress>,
}

impl ChopperHigh {
    pub fn new(ctx: &StageContext) -> Self {
        let (progress, _) = watch::channel(ChopperProgress::default());
        Self {
            rt: StageRuntime::new(Subsystem::ChopperHigh, ctx),
            progress,
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.rt.liveness()
    }

    /// Epochs written since the last start.
    pub fn progress(&self) -> watch::Receiver<ChopperProgress> {
        self.progress.subscribe()
    }

    pub async fn start(&mut self, ctx: &StageContext, mode: ProtocolMode) -> CoreResult<()> {
        let trigger = self.rt.arm(ctx);
        let heartbeat = Heartbeat::new();
        self.progress.send_replace(ChopperProgress::default());

        let mut zeros = ZeroCountMonitor::new(ctx.cfg.health.zero_count_epochs);
        let progress = self.progress.clone();
        let beat = heartbeat.clone();
        self.rt.open_log(ctx, Fifo::T1Log, move |line| {
            let Some((epoch, count)) = parse_epoch_count(line) else {
                trace!(target: "qkd.core.stage", %line, "ignoring t1 log line");
                return;
            };
            beat.touch();
            progress.send_modify(|p| {
                p.first.get_or_insert(epoch);
                p.last = Some(epoch);
                p.epochs += 1;
            });
            if let Some(epochs) = zeros.observe(count) {
                trigger.fire(RestartReason::ZeroCounts { epochs });
            }
        })?;

        let args = vec![
            "-i".into(),
            ctx.path(Fifo::RawEvents),
            "-D".into(),
            ctx.layout.dir(KeyDir::T1).display().to_string(),
            "-l".into(),
            ctx.path(Fifo::T1Log),
            "-V".into(),
            "3".into(),
            "-U".into(),
            "-F".into(),
        ];
        let spec = ProcessSpec::new(ctx.cfg.programs.chopper_high.clone(), args).stdin(StdioTarget::Null);
        self.rt.launch(spec).await?;
        heartbeat.touch();
        self.rt.watch_silence(heartbeat, ctx.silence_limit(mode));
        Ok(())
    }

    pub async fn stop(&mut self, ctx: &StageContext) {
        self.rt.stop(ctx.stop_timeout()).await;
    }
}
