use qkd_exec::prelude::*;
use qkd_model::{ProtocolMode, Subsystem};
use tracing::trace;

use super::{
    health::Heartbeat,
    runtime::{StageContext, StageRuntime, parse_epoch_count},
};
use crate::{
    ec::EcQueue,
    error::CoreResult,
    layout::{Fifo, KeyDir},
};

/// Low-side sifting: pairs local t3 files with partner-sent files into raw key.
pub struct Splicer {
    rt: StageRuntime,
}

impl Splicer {
    pub fn new(ctx: &StageContext) -> Self {
        Self {
            rt: StageRuntime::new(Subsystem::Splicer, ctx),
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.rt.liveness()
    }

    pub async fn start(&mut self, ctx: &StageContext, mode: ProtocolMode, ec: Option<EcQueue>) -> CoreResult<()> {
        self.rt.arm(ctx);
        let heartbeat = Heartbeat::new();

        let beat = heartbeat.clone();
        self.rt.open_log(ctx, Fifo::SplicerLog, move |line| {
            let Some((epoch, _)) = parse_epoch_count(line) else {
                trace!(target: "qkd.core.stage", %line, "ignoring splicer log line");
                return;
            };
            beat.touch();
            if let Some(queue) = &ec {
                queue.push(epoch);
            }
        })?;
        self.rt.forward_received(ctx, Fifo::SpliceCmd)?;

        let dir = |d: KeyDir| ctx.layout.dir(d).display().to_string();
        let args = vec![
            "-d".into(),
            dir(KeyDir::T3),
            "-D".into(),
            dir(KeyDir::Receive),
            "-f".into(),
            dir(KeyDir::RawKey),
            "-m".into(),
            ctx.path(Fifo::SpliceCmd),
            "-l".into(),
            ctx.path(Fifo::SplicerLog),
            "-V".into(),
            "1".into(),
            "-k".into(),
            "-K".into(),
        ];
        let spec = ProcessSpec::new(ctx.cfg.programs.splicer.clone(), args).stdin(StdioTarget::Null);
        self.rt.launch(spec).await?;
        heartbeat.touch();
        self.rt.watch_silence(heartbeat, ctx.silence_limit(mode));
        Ok(())
    }

    pub async fn stop(&mut self, ctx: &StageContext) {
        self.rt.stop(ctx.stop_timeout()).await;
    }
}
