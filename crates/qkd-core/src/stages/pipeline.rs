use std::{
    sync::{Arc, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use qkd_exec::Liveness;
use qkd_model::{ProcessStateSnapshot, ProtocolMode, Subsystem};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    capture::Capture,
    chopper::{ChopperHigh, ChopperLow},
    error_correction::ErrorCorrection,
    matcher::Matcher,
    runtime::StageContext,
    splicer::Splicer,
};
use crate::{
    controller::Pipeline,
    ec::{DiagnosisClassifier, EcQueue, QberObserver, RawKeyClassifier},
    error::CoreResult,
    layout::KeyDir,
    sync::{CommandPeakFinder, PeakFinder, synchronize},
};

struct Stages {
    capture: Capture,
    chopper_low: ChopperLow,
    chopper_high: ChopperHigh,
    splicer: Splicer,
    matcher: Matcher,
    error_correction: ErrorCorrection,
}

/// Every key-generation stage of this node, started per role.
pub struct StagePipeline {
    ctx: StageContext,
    classifier: Arc<dyn RawKeyClassifier>,
    finder: Arc<dyn PeakFinder>,
    observer: Option<Arc<dyn QberObserver>>,
    flags: Vec<(Subsystem, Liveness)>,
    stages: Mutex<Stages>,
    abort: std::sync::Mutex<CancellationToken>,
}

impl StagePipeline {
    pub fn new(ctx: StageContext, classifier: Arc<dyn RawKeyClassifier>, finder: Arc<dyn PeakFinder>) -> Self {
        let stages = Stages {
            capture: Capture::new(&ctx),
            chopper_low: ChopperLow::new(&ctx),
            chopper_high: ChopperHigh::new(&ctx),
            splicer: Splicer::new(&ctx),
            matcher: Matcher::new(&ctx),
            error_correction: ErrorCorrection::new(&ctx),
        };
        let flags = vec![
            (Subsystem::Capture, stages.capture.liveness()),
            (Subsystem::ChopperLow, stages.chopper_low.liveness()),
            (Subsystem::ChopperHigh, stages.chopper_high.liveness()),
            (Subsystem::Splicer, stages.splicer.liveness()),
            (Subsystem::Matcher, stages.matcher.liveness()),
            (Subsystem::ErrorCorrection, stages.error_correction.liveness()),
        ];
        Self {
            ctx,
            classifier,
            finder,
            observer: None,
            flags,
            stages: Mutex::new(stages),
            abort: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    /// Pipeline driving the configured diagnosis and peak-finder programs.
    pub fn from_config(ctx: StageContext) -> Self {
        let cfg = Arc::clone(&ctx.cfg);
        let classifier = Arc::new(DiagnosisClassifier::new(
            cfg.programs.diagnosis.clone(),
            Duration::from_millis(cfg.error_correction.diagnosis_timeout_ms),
        ));
        let finder = Arc::new(CommandPeakFinder {
            program: cfg.programs.peak_finder.clone(),
            partner_dir: ctx.layout.dir(KeyDir::Receive),
            local_dir: ctx.layout.dir(KeyDir::T1),
            search_range: cfg.sync.peak_search_range,
            limit: Duration::from_millis(cfg.sync.peak_finder_timeout_ms),
        });
        Self::new(ctx, classifier, finder)
    }

    pub fn with_observer(mut self, observer: Arc<dyn QberObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Report the transfer program's running flag alongside the stages.
    pub fn with_transfer(mut self, liveness: Liveness) -> Self {
        self.flags.push((Subsystem::Transfer, liveness));
        self
    }

    fn abort_token(&self) -> CancellationToken {
        self.abort.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn start_error_correction(&self, stages: &mut Stages, mode: ProtocolMode) -> CoreResult<Option<EcQueue>> {
        if mode != ProtocolMode::Keygen || !self.ctx.cfg.error_correction.enabled {
            return Ok(None);
        }
        let queue = stages
            .error_correction
            .start(&self.ctx, Arc::clone(&self.classifier), self.observer.clone())
            .await?;
        Ok(Some(queue))
    }

    async fn teardown(&self, stages: &mut Stages) {
        let ctx = &self.ctx;
        stages.capture.stop(ctx).await;
        stages.chopper_low.stop(ctx).await;
        stages.chopper_high.stop(ctx).await;
        stages.splicer.stop(ctx).await;
        stages.matcher.stop(ctx).await;
        stages.error_correction.stop(ctx).await;
        ctx.layout.drain();
        ctx.taps.reset_first_received();
    }
}

#[async_trait]
impl Pipeline for StagePipeline {
    async fn clear_transfer_dirs(&self) -> CoreResult<()> {
        let removed = self.ctx.layout.clear_transfer_dirs()?;
        debug!(target: "qkd.core.pipeline", removed, "transfer directories cleared");
        Ok(())
    }

    async fn start_low_side(&self, mode: ProtocolMode) -> CoreResult<()> {
        let mut stages = self.stages.lock().await;
        self.teardown(&mut stages).await;
        info!(target: "qkd.core.pipeline", ?mode, "starting low-count side");

        let ec = self.start_error_correction(&mut stages, mode).await?;
        stages.splicer.start(&self.ctx, mode, ec).await?;
        stages.chopper_low.start(&self.ctx, mode).await?;
        stages.capture.start(&self.ctx).await?;
        Ok(())
    }

    async fn start_high_side(&self, mode: ProtocolMode) -> CoreResult<()> {
        let cancel = self.abort_token();
        let mut stages = self.stages.lock().await;
        self.teardown(&mut stages).await;
        info!(target: "qkd.core.pipeline", ?mode, "starting high-count side");

        let ec = self.start_error_correction(&mut stages, mode).await?;
        let mut local = stages.chopper_high.progress();
        stages.chopper_high.start(&self.ctx, mode).await?;
        stages.capture.start(&self.ctx).await?;

        let mut partner = self.ctx.taps.first_received();
        let (window, offset) =
            synchronize(&mut partner, &mut local, &self.ctx.cfg.sync, self.finder.as_ref(), &cancel).await?;
        stages.matcher.start(&self.ctx, mode, window, offset, ec).await?;
        Ok(())
    }

    async fn stop_key_gen(&self) {
        self.abort();
        let mut stages = self.stages.lock().await;
        self.teardown(&mut stages).await;
        info!(target: "qkd.core.pipeline", "key generation stopped");
    }

    fn abort(&self) {
        let old = std::mem::take(&mut *self.abort.lock().unwrap_or_else(PoisonError::into_inner));
        old.cancel();
    }

    fn processes(&self) -> ProcessStateSnapshot {
        let mut snap = ProcessStateSnapshot::new();
        for (subsystem, liveness) in &self.flags {
            snap.set(*subsystem, liveness.is_alive());
        }
        snap
    }
}
