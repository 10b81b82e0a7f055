use std::str::FromStr;

use qkd_exec::prelude::*;
use qkd_model::{Epoch, ModelError, ProtocolMode, RestartReason, Subsystem, TimingOffset};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{
    health::{Heartbeat, PairRatioMonitor, RestartTrigger},
    runtime::{StageContext, StageRuntime, parse_epoch_count},
};
use crate::{
    ec::EcQueue,
    error::CoreResult,
    layout::{Fifo, KeyDir},
    policy::{FaultKind, FaultPolicy, Reaction},
    sync::{EpochWindow, FrequencyCorrector, FrequencyUpdate},
};

/// Per-epoch statistics line from the matcher's `genlog`.
///
/// `<epoch> <raw_events> <sent> <compressed> <coincidences> <accidentals> <time_diff>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatcherReport {
    pub epoch: Epoch,
    pub raw_events: u64,
    pub sent_events: u64,
    pub compressed_bits: u64,
    pub coincidences: u64,
    pub accidentals: u64,
    /// Tracked timing difference against the partner stream (ns).
    pub time_diff: i64,
}

impl FromStr for MatcherReport {
    type Err = ModelError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| ModelError::MalformedMessage {
            line: line.to_string(),
            reason: reason.to_string(),
        };
        let f: Vec<&str> = line.split_whitespace().collect();
        let [epoch, raw, sent, compressed, coinc, acc, diff] = f.as_slice() else {
            return Err(bad("expected 7 fields"));
        };
        let count = |s: &str| s.parse::<u64>().map_err(|_| bad("bad counter"));
        Ok(Self {
            epoch: epoch.parse()?,
            raw_events: count(raw)?,
            sent_events: count(sent)?,
            compressed_bits: count(compressed)?,
            coincidences: count(coinc)?,
            accidentals: count(acc)?,
            time_diff: diff.parse().map_err(|_| bad("bad time difference"))?,
        })
    }
}

/// High-side coincidence matcher, seeded with the synchronization result.
pub struct Matcher {
    rt: StageRuntime,
}

impl Matcher {
    pub fn new(ctx: &StageContext) -> Self {
        Self {
            rt: StageRuntime::new(Subsystem::Matcher, ctx),
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.rt.liveness()
    }

    pub async fn start(
        &mut self,
        ctx: &StageContext,
        mode: ProtocolMode,
        window: EpochWindow,
        offset: TimingOffset,
        ec: Option<EcQueue>,
    ) -> CoreResult<()> {
        let trigger = self.rt.arm(ctx);
        let heartbeat = Heartbeat::new();
        ctx.board.update_link(|l| l.offset = Some(offset));

        let taps = ctx.taps.clone();
        let beat = heartbeat.clone();
        self.rt.open_log(ctx, Fifo::MatcherLog, move |line| {
            let Some((epoch, _)) = parse_epoch_count(line) else {
                trace!(target: "qkd.core.stage", %line, "ignoring matcher log line");
                return;
            };
            beat.touch();
            taps.send_epoch(epoch);
            if let Some(queue) = &ec {
                queue.push(epoch);
            }
        })?;

        let freq = &ctx.cfg.frequency;
        let corrections = match (&freq.pipe, freq.enabled) {
            (Some(path), true) => {
                make_fifo(path)?;
                let writer = LineWriter::new(open_fifo_writer(path)?);
                let (tx, rx) = mpsc::unbounded_channel();
                let token = self.rt.token();
                self.rt.spawn(write_corrections(rx, writer, token));
                Some(tx)
            }
            _ => None,
        };

        let mut ratio = PairRatioMonitor::new(ctx.cfg.matcher.ratio_window, ctx.cfg.matcher.pair_ratio_threshold);
        let mut corrector = freq.enabled.then(|| FrequencyCorrector::new(freq));
        let board = ctx.board.clone();
        let policy = ctx.policy.clone();
        self.rt.open_log(ctx, Fifo::GenLog, move |line| {
            let report = match line.parse::<MatcherReport>() {
                Ok(r) => r,
                Err(e) => {
                    trace!(target: "qkd.core.stage", %line, error = %e, "ignoring genlog line");
                    return;
                }
            };
            board.update_link(|l| {
                l.coincidences = report.coincidences;
                l.accidentals = report.accidentals;
                l.tracked_drift = Some(report.time_diff);
            });
            if let Some(avg) = ratio.observe(report.coincidences, report.accidentals) {
                trigger.fire(RestartReason::LowPairRatio { ratio: avg });
            }
            let Some(corrector) = corrector.as_mut() else {
                return;
            };
            match corrector.observe(report.epoch, report.time_diff as f64) {
                FrequencyUpdate::Collected => {}
                FrequencyUpdate::Gap => on_frequency_gap(&policy, &trigger, report.epoch),
                FrequencyUpdate::Applied { delta, correction } => {
                    debug!(target: "qkd.core.freq", delta, correction, "frequency correction applied");
                    board.update_link(|l| l.frequency_correction = correction);
                    if let Some(tx) = &corrections {
                        let _ = tx.send(FrequencyCorrector::pipe_value(correction));
                    }
                }
            }
        })?;
        self.rt.forward_received(ctx, Fifo::MatcherCmd)?;

        let spec = ProcessSpec::new(ctx.cfg.programs.matcher.clone(), matcher_args(ctx, window, offset))
            .stdin(StdioTarget::Null);
        self.rt.launch(spec).await?;
        heartbeat.touch();
        self.rt.watch_silence(heartbeat, ctx.silence_limit(mode));
        Ok(())
    }

    pub async fn stop(&mut self, ctx: &StageContext) {
        self.rt.stop(ctx.stop_timeout()).await;
        ctx.board.update_link(|l| {
            l.offset = None;
            l.tracked_drift = None;
        });
    }
}

/// The corrector has already dropped its history; the policy decides whether the link restarts too.
fn on_frequency_gap(policy: &FaultPolicy, trigger: &RestartTrigger, epoch: Epoch) {
    match policy.reaction(FaultKind::FrequencyGap) {
        Reaction::LocalReset => {
            debug!(target: "qkd.core.freq", %epoch, "epoch gap; drift history restarted")
        }
        Reaction::LinkRestart | Reaction::Teardown => {
            trigger.fire(RestartReason::FrequencyGap { epoch });
        }
    }
}

fn matcher_args(ctx: &StageContext, window: EpochWindow, offset: TimingOffset) -> Vec<String> {
    let m = &ctx.cfg.matcher;
    let dir = |d: KeyDir| ctx.layout.dir(d).display().to_string();
    let mut args: Vec<String> = vec![
        "-d".into(),
        dir(KeyDir::Receive),
        "-D".into(),
        dir(KeyDir::T1),
        "-f".into(),
        dir(KeyDir::RawKey),
        "-F".into(),
        dir(KeyDir::Send),
        "-e".into(),
        window.start.to_string(),
        "-t".into(),
        offset.time_offset.to_string(),
        "-w".into(),
        m.coincidence_window.to_string(),
        "-u".into(),
        m.tracking_window.to_string(),
        "-Q".into(),
        m.track_filter_time_constant.to_string(),
        "-c".into(),
        ctx.path(Fifo::MatcherCmd),
        "-n".into(),
        ctx.path(Fifo::MatcherLog),
        "-g".into(),
        ctx.path(Fifo::GenLog),
        "-V".into(),
        "5".into(),
        "-k".into(),
        "-K".into(),
    ];
    if ctx.cfg.frequency.enabled
        && let Some(pipe) = &ctx.cfg.frequency.pipe
    {
        args.push("-H".into());
        args.push(pipe.display().to_string());
    }
    args
}

async fn write_corrections<W>(
    mut rx: mpsc::UnboundedReceiver<i64>,
    mut writer: LineWriter<W>,
    cancel: tokio_util::sync::CancellationToken,
) where
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    loop {
        let value = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(v) => v,
                None => break,
            },
        };
        if let Err(e) = writer.send_line(&value.to_string()).await {
            warn!(target: "qkd.core.freq", value, error = %e, "could not write frequency correction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genlog_report() {
        let r: MatcherReport = "0000abcd 1000 900 12000 480 60 -35".parse().unwrap();
        assert_eq!(r.epoch, Epoch::new(0xabcd));
        assert_eq!(r.coincidences, 480);
        assert_eq!(r.accidentals, 60);
        assert_eq!(r.time_diff, -35);

        assert!("0000abcd 1 2 3".parse::<MatcherReport>().is_err());
        assert!("0000abcd 1 2 3 x 5 6".parse::<MatcherReport>().is_err());
    }

    #[test]
    fn frequency_gap_is_absorbed_by_default() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let trigger = RestartTrigger::new(Subsystem::Matcher, tx);
        on_frequency_gap(&FaultPolicy::default(), &trigger, Epoch::new(0x20));
        assert!(trigger.is_armed());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn frequency_gap_restarts_when_policy_says_so() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let trigger = RestartTrigger::new(Subsystem::Matcher, tx);
        let policy = FaultPolicy::default().with(FaultKind::FrequencyGap, Reaction::LinkRestart);
        on_frequency_gap(&policy, &trigger, Epoch::new(0x20));
        assert!(!trigger.is_armed());
        assert_eq!(
            rx.try_recv().unwrap(),
            qkd_model::LinkEvent::RestartRequested {
                subsystem: Subsystem::Matcher,
                reason: RestartReason::FrequencyGap { epoch: Epoch::new(0x20) },
            }
        );
    }
}
