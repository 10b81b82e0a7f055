use qkd_model::{EPOCH_NANOS, Epoch, config::FrequencyConfig};

/// Scale of the integer written to the matcher's correction pipe.
const PIPE_SCALE: f64 = (1u64 << 34) as f64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrequencyUpdate {
    /// Sample stored; not enough history yet.
    Collected,
    /// Non-contiguous epoch; history restarted from this sample.
    Gap,
    /// A correction step was applied and the history cleared.
    Applied { delta: f64, correction: f64 },
}

/// Tracks clock drift against the partner from per-epoch timing differences.
#[derive(Debug, Clone)]
pub struct FrequencyCorrector {
    ignore: usize,
    average: usize,
    separation: usize,
    max_step: Option<f64>,
    history: Vec<f64>,
    last: Option<Epoch>,
    correction: f64,
}

impl FrequencyCorrector {
    pub fn new(cfg: &FrequencyConfig) -> Self {
        Self {
            ignore: cfg.ignore,
            average: cfg.average.max(1),
            separation: cfg.separation.max(1),
            max_step: cfg.max_correction,
            history: Vec::new(),
            last: None,
            correction: 0.0,
        }
    }

    /// Running fractional frequency correction.
    pub fn correction(&self) -> f64 {
        self.correction
    }

    pub fn samples(&self) -> usize {
        self.history.len()
    }

    /// Feed the timing difference `dt` (ns) observed for `epoch`.
    pub fn observe(&mut self, epoch: Epoch, dt: f64) -> FrequencyUpdate {
        let contiguous = self.last.is_none_or(|prev| epoch.follows(prev));
        self.last = Some(epoch);
        if !contiguous {
            self.history.clear();
            self.history.push(dt);
            return FrequencyUpdate::Gap;
        }

        self.history.push(dt);
        if self.history.len() < self.ignore + self.average + self.separation {
            return FrequencyUpdate::Collected;
        }

        let early = mean(&self.history[self.ignore..self.ignore + self.average]);
        let late = mean(&self.history[self.history.len() - self.average..]);
        let mut delta = (late - early) / (self.separation as f64 * EPOCH_NANOS as f64);
        if let Some(max) = self.max_step {
            delta = delta.clamp(-max, max);
        }
        self.correction = (1.0 + self.correction) * (1.0 + delta) - 1.0;
        self.history.clear();
        FrequencyUpdate::Applied {
            delta,
            correction: self.correction,
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.last = None;
    }

    /// Correction as the integer understood by the matcher.
    pub fn pipe_value(correction: f64) -> i64 {
        (correction * PIPE_SCALE).round() as i64
    }
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corrector(max: Option<f64>) -> FrequencyCorrector {
        FrequencyCorrector::new(&FrequencyConfig {
            enabled: true,
            ignore: 2,
            average: 3,
            separation: 5,
            max_correction: max,
            pipe: None,
        })
    }

    fn feed(c: &mut FrequencyCorrector, start: u32, dts: impl IntoIterator<Item = f64>) -> Vec<FrequencyUpdate> {
        dts.into_iter()
            .enumerate()
            .map(|(i, dt)| c.observe(Epoch::new(start + i as u32), dt))
            .collect()
    }

    #[test]
    fn constant_drift_gives_no_correction() {
        let mut c = corrector(None);
        let updates = feed(&mut c, 100, std::iter::repeat_n(42.0, 10));
        assert!(updates[..9].iter().all(|u| *u == FrequencyUpdate::Collected));
        match updates[9] {
            FrequencyUpdate::Applied { delta, correction } => {
                assert!(delta.abs() < 1e-15);
                assert!(correction.abs() < 1e-15);
            }
            other => panic!("expected a correction, got {other:?}"),
        }
        assert_eq!(c.samples(), 0);
    }

    #[test]
    fn increasing_drift_gives_positive_correction() {
        let mut c = corrector(None);
        let updates = feed(&mut c, 0, (0..10).map(|i| 1000.0 * i as f64));
        let FrequencyUpdate::Applied { delta, .. } = updates[9] else {
            panic!("expected a correction");
        };
        // Windows start 5 epochs apart, 1000 ns per epoch.
        let expected = 5000.0 / (5.0 * EPOCH_NANOS as f64);
        assert!((delta - expected).abs() < 1e-12);
        assert!(c.correction() > 0.0);
    }

    #[test]
    fn decreasing_drift_gives_negative_correction() {
        let mut c = corrector(None);
        feed(&mut c, 0, (0..10).map(|i| -300.0 * i as f64));
        assert!(c.correction() < 0.0);
    }

    #[test]
    fn step_is_clamped_and_compounds() {
        let mut c = corrector(Some(1e-7));
        feed(&mut c, 0, (0..10).map(|i| 1e6 * i as f64));
        assert!((c.correction() - 1e-7).abs() < 1e-15);

        feed(&mut c, 10, (0..10).map(|i| 1e6 * i as f64));
        let expected = (1.0 + 1e-7) * (1.0 + 1e-7) - 1.0;
        assert!((c.correction() - expected).abs() < 1e-15);
    }

    #[test]
    fn epoch_gap_clears_history_without_correction() {
        let mut c = corrector(None);
        feed(&mut c, 0, (0..9).map(|i| 1000.0 * i as f64));
        assert_eq!(c.samples(), 9);

        assert_eq!(c.observe(Epoch::new(20), 9000.0), FrequencyUpdate::Gap);
        assert_eq!(c.samples(), 1);
        assert_eq!(c.correction(), 0.0);
    }

    #[test]
    fn pipe_value_scale() {
        assert_eq!(FrequencyCorrector::pipe_value(0.0), 0);
        assert_eq!(FrequencyCorrector::pipe_value(1.0 / PIPE_SCALE), 1);
        assert_eq!(FrequencyCorrector::pipe_value(-1e-7), -1718);
    }
}
