use std::sync::Arc;

use qkd_exec::LineWriter;
use qkd_model::Epoch;
use tokio::{
    io::AsyncWrite,
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    accumulator::{EcAccumulator, EcBlock},
    classify::RawKeyClassifier,
};
use crate::{layout::DataRoot, state::StatusBoard};

/// Producer side of the raw-key work queue.
#[derive(Clone)]
pub struct EcQueue {
    tx: mpsc::UnboundedSender<Epoch>,
}

impl EcQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Epoch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue the raw key file of `epoch`. Returns `false` once the consumer is gone.
    pub fn push(&self, epoch: Epoch) -> bool {
        self.tx.send(epoch).is_ok()
    }
}

/// Single consumer: classifies queued files and dispatches blocks.
pub struct EcConsumer<W> {
    accumulator: EcAccumulator,
    classifier: Arc<dyn RawKeyClassifier>,
    accepted_type: u32,
    layout: DataRoot,
    servo: watch::Receiver<f64>,
    commands: LineWriter<W>,
    board: StatusBoard,
}

impl<W> EcConsumer<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        threshold: u64,
        accepted_type: u32,
        classifier: Arc<dyn RawKeyClassifier>,
        layout: DataRoot,
        servo: watch::Receiver<f64>,
        commands: LineWriter<W>,
        board: StatusBoard,
    ) -> Self {
        Self {
            accumulator: EcAccumulator::new(threshold),
            classifier,
            accepted_type,
            layout,
            servo,
            commands,
            board,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Epoch>, cancel: CancellationToken) {
        loop {
            let epoch = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(epoch) => epoch,
                    None => break,
                },
            };
            self.process(epoch).await;
        }
        self.board.update_error_correction(|s| {
            s.pending_first_epoch = None;
            s.pending_epochs = 0;
            s.pending_raw_bits = 0;
        });
    }

    /// Classify one file and feed it to the accumulator; returns the dispatched block, if any.
    pub async fn process(&mut self, epoch: Epoch) -> Option<EcBlock> {
        let path = self.layout.raw_key(epoch);
        let info = match self.classifier.classify(&path).await {
            Ok(info) if info.file_type == self.accepted_type && info.bits > 0 => info,
            Ok(info) => {
                debug!(target: "qkd.core.ec", %epoch, file_type = info.file_type, bits = info.bits, "raw key discarded");
                return None;
            }
            Err(e) => {
                warn!(target: "qkd.core.ec", %epoch, error = %e, "raw key classification failed; discarded");
                return None;
            }
        };

        let block = self.accumulator.push(epoch, info.bits);
        if let Some(block) = block {
            let qber = *self.servo.borrow();
            let line = block.command_line(qber);
            match self.commands.send_line(&line).await {
                Ok(()) => info!(
                    target: "qkd.core.ec",
                    first_epoch = %block.first_epoch,
                    epochs = block.epoch_count,
                    raw_bits = block.raw_bits,
                    qber,
                    "block dispatched"
                ),
                Err(e) => warn!(target: "qkd.core.ec", %line, error = %e, "could not dispatch block"),
            }
        }

        let pending = self.accumulator.pending();
        self.board.update_error_correction(|s| {
            s.pending_first_epoch = pending.map(|p| p.first_epoch);
            s.pending_epochs = pending.map_or(0, |p| p.epoch_count);
            s.pending_raw_bits = pending.map_or(0, |p| p.raw_bits);
        });
        block
    }
}
