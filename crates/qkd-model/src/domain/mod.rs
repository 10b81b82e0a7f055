mod epoch;
pub use epoch::{EPOCH_DURATION, EPOCH_NANOS, Epoch};

mod link;
pub use link::{ConnectionStatus, ControllerState, NegotiationState, ProtocolMode, Role};

mod message;
pub use message::{Message, Rate};

mod subsystem;
pub use subsystem::{ProcessStateSnapshot, Subsystem};

mod snapshot;
pub use snapshot::{EcHistoryEntry, ErrorCorrectionSnapshot, LinkSnapshot, TimingOffset};

mod event;
pub use event::{LinkEvent, LinkEventKind, RestartReason};
