use serde::{Deserialize, Serialize};

use crate::{ConnectionStatus, ControllerState, Epoch, NegotiationState, ProtocolMode, Role};

/// Peak-finder result used to seed the coincidence matcher.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingOffset {
    /// Coarse time offset between the two timestamp streams.
    pub time_offset: i64,
    /// Significance of the peak on the long correlation window.
    pub sig_long: f64,
    /// Significance of the peak on the short correlation window.
    pub sig_short: f64,
}

/// Link, role and timing state for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSnapshot {
    pub node: String,
    pub connection: ConnectionStatus,
    pub role: Role,
    pub negotiation: NegotiationState,
    pub state: ControllerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ProtocolMode>,
    /// Identifier of the current link session; changes on every restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<TimingOffset>,
    /// Last drift value reported by the matcher.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracked_drift: Option<i64>,
    /// Running fractional frequency correction.
    pub frequency_correction: f64,
    pub coincidences: u64,
    pub accidentals: u64,
    pub uptime_seconds: u64,
}

/// One completed error-correction block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcHistoryEntry {
    pub error_fraction: f64,
    pub final_bits: u64,
}

/// Error-correction progress for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCorrectionSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_first_epoch: Option<Epoch>,
    pub pending_epochs: u32,
    pub pending_raw_bits: u64,
    pub last_raw_bits: u64,
    pub last_final_bits: u64,
    pub last_error_fraction: f64,
    pub cumulative_final_bits: u64,
    pub servoed_qber: f64,
    pub history: Vec<EcHistoryEntry>,
}
