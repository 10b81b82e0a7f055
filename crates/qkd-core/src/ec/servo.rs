use qkd_model::config::ErrorCorrectionConfig;

/// Exponentially-weighted QBER estimate handed to the error-correction program.
#[derive(Debug, Clone)]
pub struct QberServo {
    value: f64,
    default: f64,
    floor: f64,
    limit: f64,
    blocks: f64,
}

impl QberServo {
    pub fn new(cfg: &ErrorCorrectionConfig) -> Self {
        Self {
            value: cfg.default_qber,
            default: cfg.default_qber,
            floor: cfg.qber_floor,
            limit: cfg.qber_limit,
            blocks: f64::from(cfg.servo_blocks.max(1)),
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Fold in the error fraction observed on one block.
    pub fn update(&mut self, observed: f64) -> f64 {
        let valid = |x: f64| (0.0..=1.0).contains(&x);
        if !valid(observed) {
            self.value = self.default;
            return self.value;
        }
        let next = self.value + (observed - self.value) / self.blocks;
        self.value = if valid(next) {
            next.clamp(self.floor, self.limit)
        } else {
            self.default
        };
        self.value
    }

    pub fn reset(&mut self) {
        self.value = self.default;
    }
}
