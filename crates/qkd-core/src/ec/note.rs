use std::{collections::VecDeque, str::FromStr, sync::Arc};

use qkd_model::{EcHistoryEntry, Epoch, ModelError, config::ErrorCorrectionConfig};
use tokio::sync::watch;
use tracing::{debug, info};

use super::servo::QberServo;
use crate::state::StatusBoard;

/// Completion notice for one error-corrected block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EcNote {
    pub first_epoch: Epoch,
    pub epoch_count: u32,
    pub raw_bits: u64,
    pub final_bits: u64,
    pub error_fraction: f64,
}

impl FromStr for EcNote {
    type Err = ModelError;

    /// `first_epoch epoch_count raw_bits final_bits error_fraction`
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| ModelError::MalformedMessage {
            line: line.to_string(),
            reason: reason.to_string(),
        };
        let f: Vec<&str> = line.split_whitespace().collect();
        let [first, count, raw, fin, err] = f.as_slice() else {
            return Err(bad("expected 5 fields"));
        };
        Ok(Self {
            first_epoch: first.parse()?,
            epoch_count: count.parse().map_err(|_| bad("bad epoch count"))?,
            raw_bits: raw.parse().map_err(|_| bad("bad raw bit count"))?,
            final_bits: fin.parse().map_err(|_| bad("bad final bit count"))?,
            error_fraction: err.parse().map_err(|_| bad("bad error fraction"))?,
        })
    }
}

/// Collaborator steering polarization compensation from the QBER.
pub trait QberObserver: Send + Sync + 'static {
    fn on_qber(&self, servoed: f64, observed: f64);
}

/// Folds completion notices into the servo and the dashboard snapshot.
pub struct NoteTracker {
    servo: QberServo,
    servo_tx: watch::Sender<f64>,
    history: VecDeque<EcHistoryEntry>,
    history_len: usize,
    board: StatusBoard,
    observer: Option<Arc<dyn QberObserver>>,
}

impl NoteTracker {
    pub fn new(
        cfg: &ErrorCorrectionConfig,
        board: StatusBoard,
        observer: Option<Arc<dyn QberObserver>>,
    ) -> (Self, watch::Receiver<f64>) {
        let servo = QberServo::new(cfg);
        let (servo_tx, servo_rx) = watch::channel(servo.value());
        board.update_error_correction(|s| s.servoed_qber = servo.value());
        (
            Self {
                servo,
                servo_tx,
                history: VecDeque::with_capacity(cfg.history_len),
                history_len: cfg.history_len.max(1),
                board,
                observer,
            },
            servo_rx,
        )
    }

    pub fn on_line(&mut self, line: &str) {
        match line.parse::<EcNote>() {
            Ok(note) => self.on_note(note),
            Err(e) => debug!(target: "qkd.core.ec", %line, error = %e, "ignoring notification"),
        }
    }

    pub fn on_note(&mut self, note: EcNote) {
        let servoed = self.servo.update(note.error_fraction);
        self.servo_tx.send_replace(servoed);

        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(EcHistoryEntry {
            error_fraction: note.error_fraction,
            final_bits: note.final_bits,
        });

        let history: Vec<EcHistoryEntry> = self.history.iter().copied().collect();
        self.board.update_error_correction(|s| {
            s.last_raw_bits = note.raw_bits;
            s.last_final_bits = note.final_bits;
            s.last_error_fraction = note.error_fraction;
            s.cumulative_final_bits += note.final_bits;
            s.servoed_qber = servoed;
            s.history = history;
        });
        info!(
            target: "qkd.core.ec",
            first_epoch = %note.first_epoch,
            epochs = note.epoch_count,
            final_bits = note.final_bits,
            error_fraction = note.error_fraction,
            servoed_qber = servoed,
            "block corrected"
        );

        if let Some(obs) = &self.observer {
            obs.on_qber(servoed, note.error_fraction);
        }
    }
}
