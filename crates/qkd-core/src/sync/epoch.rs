use std::{future::Future, path::PathBuf, time::Duration};

use async_trait::async_trait;
use qkd_exec::run_to_completion;
use qkd_model::{EPOCH_DURATION, Epoch, TimingOffset, config::SyncConfig};
use tokio::{sync::watch, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};

/// Epochs always discarded when the partner started before us.
const LATE_START_MARGIN: u32 = 2;

/// Progress of the local high-count chopper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChopperProgress {
    pub first: Option<Epoch>,
    pub last: Option<Epoch>,
    pub epochs: u32,
}

/// Overlapping epoch range handed to the peak finder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochWindow {
    pub start: Epoch,
    pub usable: u32,
    /// `partner_first - local_first`.
    pub epoch_diff: i64,
}

pub fn epoch_window(partner_first: Epoch, local_first: Epoch, periods: u32) -> CoreResult<EpochWindow> {
    let epoch_diff = partner_first.diff(local_first);
    let (start, usable) = if epoch_diff > 0 {
        (local_first, i64::from(periods) - epoch_diff)
    } else {
        (partner_first, i64::from(periods) - i64::from(LATE_START_MARGIN))
    };
    if usable <= 0 {
        return Err(CoreError::Sync(format!(
            "no overlapping epochs (partner {partner_first}, local {local_first}, periods {periods})"
        )));
    }
    Ok(EpochWindow {
        start,
        usable: usable as u32,
        epoch_diff,
    })
}

/// Wait for both first epochs, then for `periods` local epochs.
///
/// Each phase is bounded by `periods` epoch durations plus the configured margin.
pub async fn wait_for_epochs(
    partner: &mut watch::Receiver<Option<Epoch>>,
    local: &mut watch::Receiver<ChopperProgress>,
    cfg: &SyncConfig,
    cancel: &CancellationToken,
) -> CoreResult<(Epoch, Epoch)> {
    let limit = EPOCH_DURATION * cfg.periods + Duration::from_millis(cfg.margin_ms);

    guarded("first epochs", limit, cancel, async {
        partner.wait_for(|e| e.is_some()).await.map_err(|_| CoreError::ChannelClosed)?;
        local.wait_for(|p| p.first.is_some()).await.map_err(|_| CoreError::ChannelClosed)?;
        Ok(())
    })
    .await?;

    let periods = cfg.periods;
    guarded("local epochs", limit, cancel, async {
        local.wait_for(|p| p.epochs >= periods).await.map_err(|_| CoreError::ChannelClosed)?;
        Ok(())
    })
    .await?;

    let partner_first = (*partner.borrow()).ok_or(CoreError::ChannelClosed)?;
    let local_first = local.borrow().first.ok_or(CoreError::ChannelClosed)?;
    Ok((partner_first, local_first))
}

async fn guarded<F>(what: &str, limit: Duration, cancel: &CancellationToken, fut: F) -> CoreResult<()>
where
    F: Future<Output = CoreResult<()>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(CoreError::Cancelled),
        res = timeout(limit, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(CoreError::Sync(format!("timed out after {}ms waiting for {what}", limit.as_millis()))),
        },
    }
}

/// External correlator locating the coarse time offset between both streams.
#[async_trait]
pub trait PeakFinder: Send + Sync + 'static {
    async fn find(&self, window: &EpochWindow) -> CoreResult<TimingOffset>;
}

pub struct CommandPeakFinder {
    pub program: String,
    pub partner_dir: PathBuf,
    pub local_dir: PathBuf,
    pub search_range: u32,
    pub limit: Duration,
}

#[async_trait]
impl PeakFinder for CommandPeakFinder {
    async fn find(&self, window: &EpochWindow) -> CoreResult<TimingOffset> {
        let args = vec![
            "-d".into(),
            self.partner_dir.display().to_string(),
            "-D".into(),
            self.local_dir.display().to_string(),
            "-e".into(),
            window.start.to_string(),
            "-n".into(),
            window.usable.to_string(),
            "-r".into(),
            self.search_range.to_string(),
            "-V".into(),
            "1".into(),
        ];
        let out = run_to_completion(&self.program, &args, self.limit).await?;
        parse_peak_output(&self.program, &out)
    }
}

/// Parse `<time_offset> <sig_long> <sig_short>`.
pub fn parse_peak_output(program: &str, out: &str) -> CoreResult<TimingOffset> {
    let bad = || CoreError::BadOutput {
        program: program.to_string(),
        output: out.trim().to_string(),
    };
    let mut it = out.split_whitespace();
    let time_offset = it.next().and_then(|t| t.parse::<i64>().ok()).ok_or_else(bad)?;
    let sig_long = it.next().and_then(|t| t.parse::<f64>().ok()).ok_or_else(bad)?;
    let sig_short = it.next().and_then(|t| t.parse::<f64>().ok()).ok_or_else(bad)?;
    Ok(TimingOffset {
        time_offset,
        sig_long,
        sig_short,
    })
}

/// Full synchronization step run before the coincidence matcher starts.
pub async fn synchronize(
    partner: &mut watch::Receiver<Option<Epoch>>,
    local: &mut watch::Receiver<ChopperProgress>,
    cfg: &SyncConfig,
    finder: &dyn PeakFinder,
    cancel: &CancellationToken,
) -> CoreResult<(EpochWindow, TimingOffset)> {
    let (partner_first, local_first) = wait_for_epochs(partner, local, cfg, cancel).await?;
    let window = epoch_window(partner_first, local_first, cfg.periods)?;
    debug!(target: "qkd.core.sync", start = %window.start, usable = window.usable, diff = window.epoch_diff, "epoch window");

    let offset = tokio::select! {
        _ = cancel.cancelled() => return Err(CoreError::Cancelled),
        res = finder.find(&window) => res?,
    };
    info!(
        target: "qkd.core.sync",
        time_offset = offset.time_offset,
        sig_long = offset.sig_long,
        sig_short = offset.sig_short,
        "peak found"
    );
    Ok((window, offset))
}
