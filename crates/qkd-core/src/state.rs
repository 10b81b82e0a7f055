use std::sync::{Arc, PoisonError, RwLock};

use qkd_model::{ErrorCorrectionSnapshot, LinkSnapshot, ProcessStateSnapshot};

use crate::system;

/// In-memory status shared with the status-query API.
///
/// Every field group has one writer: the controller and relay for link fields, the watchdog for
/// process flags, the error-correction stage for its snapshot, the matcher for timing data.
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<StatusInner>>,
}

#[derive(Default)]
struct StatusInner {
    link: LinkSnapshot,
    processes: ProcessStateSnapshot,
    error_correction: ErrorCorrectionSnapshot,
}

impl StatusBoard {
    pub fn new(node: impl Into<String>) -> Self {
        let board = Self::default();
        board.update_link(|l| l.node = node.into());
        board
    }

    pub fn update_link(&self, f: impl FnOnce(&mut LinkSnapshot)) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner.link);
    }

    pub fn set_processes(&self, processes: ProcessStateSnapshot) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.processes = processes;
    }

    pub fn update_error_correction(&self, f: impl FnOnce(&mut ErrorCorrectionSnapshot)) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner.error_correction);
    }

    /// Link snapshot with the current uptime filled in.
    pub fn link(&self) -> LinkSnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut link = inner.link.clone();
        link.uptime_seconds = system::uptime_seconds();
        link
    }

    pub fn processes(&self) -> ProcessStateSnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.processes.clone()
    }

    pub fn error_correction(&self) -> ErrorCorrectionSnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.error_correction.clone()
    }
}
