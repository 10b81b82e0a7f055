use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use qkd_model::{LinkEvent, RestartReason, Subsystem};
use tokio::{sync::mpsc, task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Restart request of one stage run; fires at most once.
#[derive(Clone)]
pub struct RestartTrigger {
    subsystem: Subsystem,
    armed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl RestartTrigger {
    pub fn new(subsystem: Subsystem, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            subsystem,
            armed: Arc::new(AtomicBool::new(true)),
            events,
        }
    }

    /// Returns `true` if this call delivered the request.
    pub fn fire(&self, reason: RestartReason) -> bool {
        if !self.armed.swap(false, Ordering::AcqRel) {
            trace!(target: "qkd.core.stage", subsystem = %self.subsystem, %reason, "restart already requested");
            return false;
        }
        warn!(target: "qkd.core.stage", subsystem = %self.subsystem, %reason, "requesting restart");
        self.events
            .send(LinkEvent::RestartRequested {
                subsystem: self.subsystem,
                reason,
            })
            .is_ok()
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

/// Time of the last sign of life from a stage's log channel.
#[derive(Clone)]
pub struct Heartbeat {
    base: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn touch(&self) {
        let now = self.base.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Release);
    }

    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Acquire));
        self.base.elapsed().saturating_sub(last)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Fire `trigger` once the heartbeat has been idle for longer than `limit`.
pub fn spawn_silence_watch(
    heartbeat: Heartbeat,
    limit: Duration,
    trigger: RestartTrigger,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let period = (limit / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    tokio::spawn(async move {
        let mut tick = interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            let idle = heartbeat.idle();
            if idle > limit {
                trigger.fire(RestartReason::Silence {
                    seconds: idle.as_secs(),
                });
                return;
            }
        }
    })
}

/// Detects a run of epochs without detector events.
#[derive(Debug, Clone)]
pub struct ZeroCountMonitor {
    limit: u32,
    run: u32,
}

impl ZeroCountMonitor {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            run: 0,
        }
    }

    /// Returns the run length when it reaches the limit.
    pub fn observe(&mut self, events: u64) -> Option<u32> {
        if events > 0 {
            self.run = 0;
            return None;
        }
        self.run += 1;
        (self.run == self.limit).then_some(self.run)
    }
}

/// Averages the pairs-to-accidentals ratio over the most recent reports.
#[derive(Debug, Clone)]
pub struct PairRatioMonitor {
    window: VecDeque<f64>,
    size: usize,
    threshold: f64,
}

impl PairRatioMonitor {
    pub fn new(size: usize, threshold: f64) -> Self {
        let size = size.max(1);
        Self {
            window: VecDeque::with_capacity(size),
            size,
            threshold,
        }
    }

    /// Returns the averaged ratio once a full window falls below the threshold.
    pub fn observe(&mut self, coincidences: u64, accidentals: u64) -> Option<f64> {
        // No pairs at all is a dead link, not a perfect ratio.
        let ratio = match (coincidences, accidentals) {
            (0, _) => 0.0,
            (_, 0) => f64::INFINITY,
            (c, a) => c as f64 / a as f64,
        };
        if self.window.len() == self.size {
            self.window.pop_front();
        }
        self.window.push_back(ratio);
        if self.window.len() < self.size {
            return None;
        }
        let avg = self.window.iter().sum::<f64>() / self.size as f64;
        (avg < self.threshold).then_some(avg)
    }
}
