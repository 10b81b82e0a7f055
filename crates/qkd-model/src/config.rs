//! Link configuration document.
//!
//! A single JSON object read once at startup. Every section has defaults, so a minimal document only needs the partner endpoint.
use std::{fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::ModelError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinkConfig {
    /// Root directory holding every pipe and transfer directory.
    pub data_root: PathBuf,
    /// Human-readable node name; defaults to the hostname.
    pub node_name: Option<String>,
    pub network: NetworkConfig,
    pub programs: ProgramsConfig,
    pub capture: CaptureConfig,
    pub matcher: MatcherConfig,
    pub sync: SyncConfig,
    pub frequency: FrequencyConfig,
    pub error_correction: ErrorCorrectionConfig,
    pub health: HealthConfig,
    pub negotiation: NegotiationConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/tmp/qkd"),
            node_name: None,
            network: NetworkConfig::default(),
            programs: ProgramsConfig::default(),
            capture: CaptureConfig::default(),
            matcher: MatcherConfig::default(),
            sync: SyncConfig::default(),
            frequency: FrequencyConfig::default(),
            error_correction: ErrorCorrectionConfig::default(),
            health: HealthConfig::default(),
            negotiation: NegotiationConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Read and validate a config document.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| ModelError::ConfigIo(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        let cfg: LinkConfig =
            serde_json::from_str(raw).map_err(|e| ModelError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let invalid = |msg: &str| Err(ModelError::InvalidConfig(msg.to_string()));

        if self.network.target_ip.trim().is_empty() {
            return invalid("network.targetIp cannot be empty");
        }
        if self.sync.periods < 3 {
            return invalid("sync.periods must be at least 3");
        }
        let ec = &self.error_correction;
        if ec.servo_blocks == 0 {
            return invalid("errorCorrection.servoBlocks cannot be zero");
        }
        if !(0.0..=1.0).contains(&ec.qber_floor)
            || !(0.0..=1.0).contains(&ec.qber_limit)
            || ec.qber_floor > ec.qber_limit
        {
            return invalid("errorCorrection qber range must satisfy 0 <= floor <= limit <= 1");
        }
        if !(ec.qber_floor..=ec.qber_limit).contains(&ec.default_qber) {
            return invalid("errorCorrection.defaultQber must lie inside the qber range");
        }
        let fq = &self.frequency;
        if fq.average == 0 || fq.separation == 0 {
            return invalid("frequency.average and frequency.separation must be positive");
        }
        if let Some(max) = fq.max_correction
            && max <= 0.0
        {
            return invalid("frequency.maxCorrection must be positive");
        }
        if self.matcher.ratio_window == 0 {
            return invalid("matcher.ratioWindow cannot be zero");
        }
        if self.health.zero_count_epochs == 0 {
            return invalid("health.zeroCountEpochs cannot be zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Partner address handed to the transfer program.
    pub target_ip: String,
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            target_ip: "127.0.0.1".to_string(),
            port: 4852,
        }
    }
}

/// Paths (or names on `PATH`) of the external pipeline programs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgramsConfig {
    pub transfer: String,
    pub capture: String,
    pub chopper_low: String,
    pub chopper_high: String,
    pub splicer: String,
    pub matcher: String,
    pub error_correction: String,
    pub peak_finder: String,
    pub diagnosis: String,
    /// Full argv of a one-shot program printing the local detection rate (counts/s).
    pub rate_probe: Vec<String>,
}

impl Default for ProgramsConfig {
    fn default() -> Self {
        Self {
            transfer: "transferd".into(),
            capture: "readevents".into(),
            chopper_low: "chopper".into(),
            chopper_high: "chopper2".into(),
            splicer: "splicer".into(),
            matcher: "costream".into(),
            error_correction: "ecd2".into(),
            peak_finder: "pfind".into(),
            diagnosis: "diagnosis".into(),
            rate_probe: vec![
                "sh".into(),
                "-c".into(),
                "readevents -a 1 -X -q 100000 | getrate".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ClockSource {
    #[default]
    Internal,
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureConfig {
    pub clock_source: ClockSource,
    /// Per-detector timing skew, one value per detector channel.
    pub detector_skews: [i32; 4],
    pub extra_args: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            clock_source: ClockSource::Internal,
            detector_skews: [0; 4],
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MatcherConfig {
    /// Coincidence window width handed to the matcher.
    pub coincidence_window: u32,
    /// Tracking window width handed to the matcher.
    pub tracking_window: u32,
    pub track_filter_time_constant: u64,
    /// Restart when the averaged pairs/accidentals ratio drops below this.
    pub pair_ratio_threshold: f64,
    /// Number of recent reports averaged for the ratio check.
    pub ratio_window: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            coincidence_window: 6,
            tracking_window: 30,
            track_filter_time_constant: 2_000_000,
            pair_ratio_threshold: 2.5,
            ratio_window: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Number of epochs fed to the peak finder.
    pub periods: u32,
    /// Extra time granted on top of `periods` epochs while waiting for data.
    pub margin_ms: u64,
    /// Search range handed to the peak finder.
    pub peak_search_range: u32,
    pub peak_finder_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            periods: 8,
            margin_ms: 2_000,
            peak_search_range: 8_192,
            peak_finder_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FrequencyConfig {
    pub enabled: bool,
    /// Samples dropped at the start of each history.
    pub ignore: usize,
    /// Size of the early and late averaging windows.
    pub average: usize,
    /// Distance in epochs between the early and late windows.
    pub separation: usize,
    /// Largest correction step applied at once, if set.
    pub max_correction: Option<f64>,
    /// Pipe receiving the running correction, if set.
    pub pipe: Option<PathBuf>,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ignore: 3,
            average: 5,
            separation: 10,
            max_correction: Some(1e-7),
            pipe: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorCorrectionConfig {
    pub enabled: bool,
    /// A block is dispatched once accumulated raw bits exceed this.
    pub raw_bits_threshold: u64,
    pub default_qber: f64,
    pub qber_floor: f64,
    pub qber_limit: f64,
    /// Servo divisor `N` in `servoed += (observed - servoed) / N`.
    pub servo_blocks: u32,
    pub history_len: usize,
    /// File type reported by the diagnosis program for raw key files.
    pub accepted_file_type: u32,
    pub diagnosis_timeout_ms: u64,
}

impl Default for ErrorCorrectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            raw_bits_threshold: 10_000,
            default_qber: 0.05,
            qber_floor: 0.0,
            qber_limit: 0.12,
            servo_blocks: 5,
            history_len: 50,
            accepted_file_type: 3,
            diagnosis_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthConfig {
    pub silence_keygen_secs: u64,
    pub silence_service_secs: u64,
    /// Consecutive zero-count epochs treated as a detector fault.
    pub zero_count_epochs: u32,
    pub monitor_grace_ms: u64,
    pub monitor_interval_ms: u64,
    pub stop_timeout_ms: u64,
    pub pipe_poll_ms: u64,
    pub watchdog_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            silence_keygen_secs: 30,
            silence_service_secs: 120,
            zero_count_epochs: 5,
            monitor_grace_ms: 2_000,
            monitor_interval_ms: 2_000,
            stop_timeout_ms: 3_000,
            pipe_poll_ms: 100,
            watchdog_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NegotiationConfig {
    pub timeout_ms: u64,
    pub rate_probe_timeout_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            rate_probe_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiConfig {
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingConfig {
    /// `text`, `json` or `journald`.
    pub format: String,
    pub level: String,
    pub with_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
            level: "info".to_string(),
            with_targets: true,
        }
    }
}
