//! Which faults a component absorbs on its own and which restart the whole link.
use std::collections::HashMap;

use qkd_model::RestartReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    ProcessExited,
    ZeroCounts,
    Silence,
    LowPairRatio,
    SyncFailed,
    StartFailed,
    /// Non-contiguous epoch in the frequency history.
    FrequencyGap,
    /// Partner connection dropped.
    LinkLost,
}

impl From<&RestartReason> for FaultKind {
    fn from(reason: &RestartReason) -> Self {
        match reason {
            RestartReason::ProcessExited { .. } => FaultKind::ProcessExited,
            RestartReason::ZeroCounts { .. } => FaultKind::ZeroCounts,
            RestartReason::Silence { .. } => FaultKind::Silence,
            RestartReason::LowPairRatio { .. } => FaultKind::LowPairRatio,
            RestartReason::FrequencyGap { .. } => FaultKind::FrequencyGap,
            RestartReason::SyncFailed(_) => FaultKind::SyncFailed,
            RestartReason::StartFailed(_) => FaultKind::StartFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// The detecting component resets its own state; nothing else happens.
    LocalReset,
    /// Tear down key generation, tell the partner, renegotiate and resequence.
    LinkRestart,
    /// Tear down key generation and wait for the link to come back.
    Teardown,
}

#[derive(Debug, Clone)]
pub struct FaultPolicy {
    table: HashMap<FaultKind, Reaction>,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        let table = HashMap::from([
            (FaultKind::FrequencyGap, Reaction::LocalReset),
            (FaultKind::ProcessExited, Reaction::LinkRestart),
            (FaultKind::ZeroCounts, Reaction::LinkRestart),
            (FaultKind::Silence, Reaction::LinkRestart),
            (FaultKind::LowPairRatio, Reaction::LinkRestart),
            (FaultKind::SyncFailed, Reaction::LinkRestart),
            (FaultKind::StartFailed, Reaction::LinkRestart),
            (FaultKind::LinkLost, Reaction::Teardown),
        ]);
        Self { table }
    }
}

impl FaultPolicy {
    pub fn with(mut self, kind: FaultKind, reaction: Reaction) -> Self {
        self.table.insert(kind, reaction);
        self
    }

    pub fn reaction(&self, kind: FaultKind) -> Reaction {
        self.table.get(&kind).copied().unwrap_or(Reaction::LinkRestart)
    }

    pub fn reaction_for(&self, reason: &RestartReason) -> Reaction {
        self.reaction(FaultKind::from(reason))
    }
}
