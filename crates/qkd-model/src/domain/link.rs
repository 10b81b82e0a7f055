use serde::{Deserialize, Serialize};

/// Which variant of the asymmetric pipeline a node runs.
///
/// Decided once per negotiation cycle by comparing detection rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// Node with the smaller detection rate (chopper + splicer side).
    LowCountSide,
    /// Node with the larger detection rate (chopper2 + coincidence matcher side).
    HighCountSide,
    /// Negotiation has not finished.
    #[default]
    Undetermined,
}

impl Role {
    pub fn is_determined(&self) -> bool {
        !matches!(self, Role::Undetermined)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::LowCountSide => "low",
            Role::HighCountSide => "high",
            Role::Undetermined => "undetermined",
        }
    }
}

/// Progress of the symmetry negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum NegotiationState {
    #[default]
    NotDone,
    Pending,
    Finished,
}

/// Selects argument sets and error thresholds for every subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolMode {
    /// Calibration / tracking only; no error correction.
    Service,
    /// Full key generation.
    #[default]
    Keygen,
}

/// Top-level controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ControllerState {
    #[default]
    Idle,
    Communicating,
    Negotiating,
    KeyGeneration,
    ServiceMode,
}

impl ControllerState {
    /// Returns `true` while a pipeline (keygen or service) is active.
    pub fn is_pipeline_active(&self) -> bool {
        matches!(self, ControllerState::KeyGeneration | ControllerState::ServiceMode)
    }
}

/// Network session status as reported by the transfer program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}
