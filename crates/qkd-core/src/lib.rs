pub mod error;
pub use error::{CoreError, CoreResult};

pub mod layout;
pub use layout::{DataRoot, Fifo, KeyDir};

pub mod negotiation;
pub use negotiation::Negotiator;

pub mod relay;
pub use relay::{CommandRateProbe, RateProbe, Relay, RelayHandle, RelayTaps};

pub mod policy;
pub use policy::{FaultKind, FaultPolicy, Reaction};

pub mod subscriber;
pub use subscriber::{EventBus, Subscribe};

pub mod sync;
pub mod ec;

pub mod stages;
pub use stages::{StageContext, StagePipeline};

pub mod controller;
pub use controller::{Controller, PartnerLink, Pipeline};

pub mod watchdog;
pub use watchdog::Watchdog;

pub mod state;
pub use state::StatusBoard;

pub mod system;
