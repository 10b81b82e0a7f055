use qkd_model::Epoch;

/// A block of consecutive raw-key epochs ready for error correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcBlock {
    pub first_epoch: Epoch,
    pub epoch_count: u32,
    pub raw_bits: u64,
}

impl EcBlock {
    /// Command line for the error-correction program.
    pub fn command_line(&self, qber: f64) -> String {
        format!("{} {} {:.4}", self.first_epoch, self.epoch_count, qber)
    }
}

/// Collects accepted raw-key files until their bit count passes the threshold.
#[derive(Debug, Clone)]
pub struct EcAccumulator {
    threshold: u64,
    pending: Option<EcBlock>,
}

impl EcAccumulator {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            pending: None,
        }
    }

    pub fn pending(&self) -> Option<EcBlock> {
        self.pending
    }

    /// Add one file; returns the finished block once accumulated bits exceed the threshold.
    pub fn push(&mut self, epoch: Epoch, raw_bits: u64) -> Option<EcBlock> {
        let block = self.pending.get_or_insert(EcBlock {
            first_epoch: epoch,
            epoch_count: 0,
            raw_bits: 0,
        });
        block.epoch_count += 1;
        block.raw_bits += raw_bits;

        if block.raw_bits > self.threshold {
            self.pending.take()
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }
}
