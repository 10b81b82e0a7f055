use std::sync::Arc;

use qkd_exec::prelude::*;
use qkd_model::Subsystem;

use super::runtime::{StageContext, StageRuntime};
use crate::{
    ec::{EcConsumer, EcQueue, NoteTracker, QberObserver, RawKeyClassifier},
    error::CoreResult,
    layout::{Fifo, KeyDir},
};

/// Error-correction program plus the raw-key queue feeding it and the notice tracker reading it.
pub struct ErrorCorrection {
    rt: StageRuntime,
}

impl ErrorCorrection {
    pub fn new(ctx: &StageContext) -> Self {
        Self {
            rt: StageRuntime::new(Subsystem::ErrorCorrection, ctx),
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.rt.liveness()
    }

    /// Start the program; returns the queue sifting stages push finished raw-key epochs into.
    pub async fn start(
        &mut self,
        ctx: &StageContext,
        classifier: Arc<dyn RawKeyClassifier>,
        observer: Option<Arc<dyn QberObserver>>,
    ) -> CoreResult<EcQueue> {
        self.rt.arm(ctx);
        let ec = &ctx.cfg.error_correction;

        let (mut tracker, servo) = NoteTracker::new(ec, ctx.board.clone(), observer);
        self.rt.open_log(ctx, Fifo::EcNote, move |line| tracker.on_line(line))?;

        let (queue, rx) = EcQueue::new();
        let commands = LineWriter::new(open_fifo_writer(&ctx.layout.fifo(Fifo::EcCmd))?);
        let consumer = EcConsumer::new(
            ec.raw_bits_threshold,
            ec.accepted_file_type,
            classifier,
            ctx.layout.clone(),
            servo,
            commands,
            ctx.board.clone(),
        );
        let token = self.rt.token();
        self.rt.spawn(consumer.run(rx, token));

        let dir = |d: KeyDir| ctx.layout.dir(d).display().to_string();
        let args = vec![
            "-c".into(),
            ctx.path(Fifo::EcCmd),
            "-s".into(),
            ctx.path(Fifo::EcSend),
            "-r".into(),
            ctx.path(Fifo::EcReceive),
            "-d".into(),
            dir(KeyDir::RawKey),
            "-f".into(),
            dir(KeyDir::FinalKey),
            "-l".into(),
            ctx.path(Fifo::EcNote),
            "-Q".into(),
            ctx.path(Fifo::EcQuery),
            "-q".into(),
            ctx.path(Fifo::EcResponse),
            "-E".into(),
            format!("{:.4}", ec.default_qber),
            "-V".into(),
            "2".into(),
        ];
        let spec = ProcessSpec::new(ctx.cfg.programs.error_correction.clone(), args).stdin(StdioTarget::Null);
        self.rt.launch(spec).await?;
        Ok(queue)
    }

    pub async fn stop(&mut self, ctx: &StageContext) {
        self.rt.stop(ctx.stop_timeout()).await;
    }
}
