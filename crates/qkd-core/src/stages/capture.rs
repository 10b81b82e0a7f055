use qkd_exec::prelude::*;
use qkd_model::{Subsystem, config::ClockSource};

use super::runtime::{StageContext, StageRuntime};
use crate::{error::CoreResult, layout::Fifo};

/// Detector timestamp capture writing binary events into `rawevents`.
pub struct Capture {
    rt: StageRuntime,
}

impl Capture {
    pub fn new(ctx: &StageContext) -> Self {
        Self {
            rt: StageRuntime::new(Subsystem::Capture, ctx),
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.rt.liveness()
    }

    pub async fn start(&mut self, ctx: &StageContext) -> CoreResult<()> {
        self.rt.arm(ctx);
        let out = open_fifo_for_stdio(&ctx.layout.fifo(Fifo::RawEvents))?;
        let spec = ProcessSpec::new(ctx.cfg.programs.capture.clone(), capture_args(ctx))
            .stdin(StdioTarget::Null)
            .stdout(StdioTarget::File(out));
        self.rt.launch(spec).await?;
        Ok(())
    }

    pub async fn stop(&mut self, ctx: &StageContext) {
        self.rt.stop(ctx.stop_timeout()).await;
    }
}

fn capture_args(ctx: &StageContext) -> Vec<String> {
    let cap = &ctx.cfg.capture;
    let mut args: Vec<String> = vec!["-a".into(), "1".into(), "-X".into()];
    if cap.clock_source == ClockSource::External {
        args.push("-e".into());
    }
    if cap.detector_skews.iter().any(|s| *s != 0) {
        let skews: Vec<String> = cap.detector_skews.iter().map(i32::to_string).collect();
        args.push("-D".into());
        args.push(skews.join(","));
    }
    args.extend(cap.extra_args.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use qkd_model::LinkConfig;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{layout::DataRoot, policy::FaultPolicy, relay::RelayTaps, state::StatusBoard};

    fn ctx(cfg: LinkConfig) -> StageContext {
        let (events, _) = mpsc::unbounded_channel();
        let (taps, _) = RelayTaps::new();
        StageContext {
            cfg: Arc::new(cfg),
            layout: DataRoot::new("/q"),
            events,
            taps,
            board: StatusBoard::default(),
            policy: FaultPolicy::default(),
        }
    }

    #[test]
    fn default_arguments_use_the_internal_clock() {
        let args = capture_args(&ctx(LinkConfig::default()));
        assert_eq!(args, vec!["-a", "1", "-X"]);
    }

    #[test]
    fn external_clock_and_skews() {
        let mut cfg = LinkConfig::default();
        cfg.capture.clock_source = ClockSource::External;
        cfg.capture.detector_skews = [1, -2, 0, 3];
        cfg.capture.extra_args = vec!["-q".into(), "0".into()];
        let args = capture_args(&ctx(cfg));
        assert_eq!(args, vec!["-a", "1", "-X", "-e", "-D", "1,-2,0,3", "-q", "0"]);
    }
}
