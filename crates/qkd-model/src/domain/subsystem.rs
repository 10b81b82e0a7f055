use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// A long-running pipeline stage driven by one external program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Subsystem {
    /// Network session to the partner (transfer program).
    Transfer,
    /// Detector timestamp capture.
    Capture,
    /// Low-count-side chopper (local + partner-bound streams).
    ChopperLow,
    /// High-count-side chopper.
    ChopperHigh,
    Splicer,
    /// Coincidence matcher.
    Matcher,
    ErrorCorrection,
}

impl Subsystem {
    /// Every stage torn down by a key-generation stop (the transfer session survives).
    pub const KEY_GENERATION: [Subsystem; 6] = [
        Subsystem::Capture,
        Subsystem::ChopperLow,
        Subsystem::ChopperHigh,
        Subsystem::Splicer,
        Subsystem::Matcher,
        Subsystem::ErrorCorrection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Transfer => "transfer",
            Subsystem::Capture => "capture",
            Subsystem::ChopperLow => "chopper-low",
            Subsystem::ChopperHigh => "chopper-high",
            Subsystem::Splicer => "splicer",
            Subsystem::Matcher => "matcher",
            Subsystem::ErrorCorrection => "error-correction",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subsystem → running flag, taken at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessStateSnapshot(pub BTreeMap<Subsystem, bool>);

impl ProcessStateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, subsystem: Subsystem, running: bool) {
        self.0.insert(subsystem, running);
    }

    pub fn is_running(&self, subsystem: Subsystem) -> bool {
        self.0.get(&subsystem).copied().unwrap_or(false)
    }

    /// Returns `true` if no key-generation stage is running.
    pub fn key_generation_idle(&self) -> bool {
        Subsystem::KEY_GENERATION
            .iter()
            .all(|s| !self.is_running(*s))
    }

    /// Subsystems whose running flag differs between `previous` and `self`.
    ///
    /// A subsystem missing from one side counts as not running.
    pub fn edges_since(&self, previous: &ProcessStateSnapshot) -> Vec<(Subsystem, bool)> {
        let mut keys: Vec<Subsystem> = self.0.keys().chain(previous.0.keys()).copied().collect();
        keys.sort();
        keys.dedup();
        keys.into_iter()
            .filter_map(|s| {
                let now = self.is_running(s);
                (now != previous.is_running(s)).then_some((s, now))
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Subsystem, &bool)> {
        self.0.iter()
    }
}
