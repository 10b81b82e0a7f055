use qkd_model::{ConnectionStatus, LinkEvent, LinkEventKind};
use tracing::{debug, error, info, trace, warn};

#[inline]
pub fn message_for(kind: LinkEventKind) -> &'static str {
    match kind {
        // partner
        LinkEventKind::Message => "message from partner",
        LinkEventKind::ConnectionChanged => "partner connection changed",

        // negotiation
        LinkEventKind::NegotiationFinished => "symmetry negotiation finished",
        LinkEventKind::NegotiationMismatch => "negotiation aborted; partner echo did not match",

        // controller
        LinkEventKind::StateChanged => "controller state transition",
        LinkEventKind::RestartRequested => "subsystem requested a link restart",

        // processes
        LinkEventKind::ProcessEdge => "process running flag changed",
    }
}

#[inline]
pub fn log_event(e: &LinkEvent) {
    let msg = message_for(e.kind());

    match e {
        LinkEvent::Message(m) => debug!(target: "qkd.observe.journal", wire = %m, "{msg}"),
        LinkEvent::ConnectionChanged(ConnectionStatus::Connected) => {
            info!(target: "qkd.observe.journal", status = "connected", "{msg}")
        }
        LinkEvent::ConnectionChanged(ConnectionStatus::Disconnected) => {
            warn!(target: "qkd.observe.journal", status = "disconnected", "{msg}")
        }

        LinkEvent::NegotiationFinished { role } => {
            info!(target: "qkd.observe.journal", role = role.as_str(), "{msg}")
        }
        LinkEvent::NegotiationMismatch { reason } => {
            error!(target: "qkd.observe.journal", reason = %reason, "{msg}")
        }

        LinkEvent::StateChanged { from, to } => {
            debug!(target: "qkd.observe.journal", from = ?from, to = ?to, "{msg}")
        }
        LinkEvent::RestartRequested { subsystem, reason } => {
            warn!(target: "qkd.observe.journal", %subsystem, reason = %reason, "{msg}")
        }

        LinkEvent::ProcessEdge { subsystem, running } => {
            trace!(target: "qkd.observe.journal", %subsystem, running, "{msg}")
        }
    }
}
