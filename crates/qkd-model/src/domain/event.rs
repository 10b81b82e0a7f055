use std::fmt;

use crate::{ConnectionStatus, ControllerState, Epoch, Message, Role, Subsystem};

/// Why a subsystem asks for a link-level restart.
#[derive(Debug, Clone, PartialEq)]
pub enum RestartReason {
    /// The child exited while it was expected to run.
    ProcessExited { code: Option<i32> },
    /// The detector reported no events for this many consecutive epochs.
    ZeroCounts { epochs: u32 },
    /// No log output for longer than the mode's silence timeout.
    Silence { seconds: u64 },
    /// Pairs-to-accidentals ratio averaged over recent reports fell below the threshold.
    LowPairRatio { ratio: f64 },
    /// The matcher's drift history broke at this epoch.
    FrequencyGap { epoch: Epoch },
    /// Epoch synchronization or peak finding failed.
    SyncFailed(String),
    /// A stage could not be started.
    StartFailed(String),
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::ProcessExited { code: Some(code) } => {
                write!(f, "process exited with code {code}")
            }
            RestartReason::ProcessExited { code: None } => f.write_str("process killed by signal"),
            RestartReason::ZeroCounts { epochs } => write!(f, "zero counts for {epochs} epochs"),
            RestartReason::Silence { seconds } => write!(f, "silent for {seconds}s"),
            RestartReason::LowPairRatio { ratio } => {
                write!(f, "pairs/accidentals ratio {ratio:.2} too low")
            }
            RestartReason::FrequencyGap { epoch } => write!(f, "frequency history gap at epoch {epoch}"),
            RestartReason::SyncFailed(e) => write!(f, "synchronization failed: {e}"),
            RestartReason::StartFailed(e) => write!(f, "start failed: {e}"),
        }
    }
}

/// Notification delivered to the controller's event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Non-negotiation message received from the partner.
    Message(Message),
    /// A subsystem detected a fault and asks for a restart.
    RestartRequested {
        subsystem: Subsystem,
        reason: RestartReason,
    },
    ConnectionChanged(ConnectionStatus),
    NegotiationFinished { role: Role },
    /// Negotiation aborted because the partner's echo did not match.
    NegotiationMismatch { reason: String },
    StateChanged {
        from: ControllerState,
        to: ControllerState,
    },
    /// A subsystem's running flag flipped.
    ProcessEdge { subsystem: Subsystem, running: bool },
}

/// Discriminant of [`LinkEvent`], used for routing and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEventKind {
    Message,
    RestartRequested,
    ConnectionChanged,
    NegotiationFinished,
    NegotiationMismatch,
    StateChanged,
    ProcessEdge,
}

impl LinkEvent {
    pub fn kind(&self) -> LinkEventKind {
        match self {
            LinkEvent::Message(_) => LinkEventKind::Message,
            LinkEvent::RestartRequested { .. } => LinkEventKind::RestartRequested,
            LinkEvent::ConnectionChanged(_) => LinkEventKind::ConnectionChanged,
            LinkEvent::NegotiationFinished { .. } => LinkEventKind::NegotiationFinished,
            LinkEvent::NegotiationMismatch { .. } => LinkEventKind::NegotiationMismatch,
            LinkEvent::StateChanged { .. } => LinkEventKind::StateChanged,
            LinkEvent::ProcessEdge { .. } => LinkEventKind::ProcessEdge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_reason_messages() {
        assert_eq!(
            RestartReason::ProcessExited { code: Some(3) }.to_string(),
            "process exited with code 3"
        );
        assert_eq!(
            RestartReason::LowPairRatio { ratio: 1.234 }.to_string(),
            "pairs/accidentals ratio 1.23 too low"
        );
    }

    #[test]
    fn kind_matches_variant() {
        let ev = LinkEvent::RestartRequested {
            subsystem: Subsystem::Matcher,
            reason: RestartReason::Silence { seconds: 30 },
        };
        assert_eq!(ev.kind(), LinkEventKind::RestartRequested);
        assert_eq!(
            LinkEvent::Message(Message::St1).kind(),
            LinkEventKind::Message
        );
    }
}
