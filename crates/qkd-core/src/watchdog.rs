//! Periodic supervision of the stage processes and the partner connection.
use std::{sync::Arc, time::Duration};

use qkd_model::{ConnectionStatus, LinkEvent, ProcessStateSnapshot, Subsystem};
use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    controller::{PartnerLink, Pipeline},
    state::StatusBoard,
};

/// What one poll observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tick {
    pub edges: Vec<(Subsystem, bool)>,
    /// The connection went from connected to disconnected since the previous poll.
    pub link_lost: bool,
}

pub struct Watchdog {
    pipeline: Arc<dyn Pipeline>,
    link: Arc<dyn PartnerLink>,
    board: StatusBoard,
    events: mpsc::UnboundedSender<LinkEvent>,
    previous: ProcessStateSnapshot,
    connection: ConnectionStatus,
}

impl Watchdog {
    pub fn new(
        pipeline: Arc<dyn Pipeline>,
        link: Arc<dyn PartnerLink>,
        board: StatusBoard,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            pipeline,
            link,
            board,
            events,
            previous: ProcessStateSnapshot::new(),
            connection: ConnectionStatus::Disconnected,
        }
    }

    /// Compare a fresh observation with the previous one.
    pub fn observe(&mut self, processes: ProcessStateSnapshot, connection: ConnectionStatus) -> Tick {
        let edges = processes.edges_since(&self.previous);
        let link_lost = self.connection.is_connected() && !connection.is_connected();
        self.previous = processes;
        self.connection = connection;
        Tick { edges, link_lost }
    }

    pub async fn tick(&mut self) -> Tick {
        let processes = self.pipeline.processes();
        let connection = self.link.connection();
        self.board.set_processes(processes.clone());

        let tick = self.observe(processes, connection);
        for &(subsystem, running) in &tick.edges {
            info!(target: "qkd.core.watchdog", %subsystem, running, "process state changed");
            let _ = self.events.send(LinkEvent::ProcessEdge { subsystem, running });
        }
        if tick.link_lost {
            warn!(target: "qkd.core.watchdog", "partner connection lost; stopping key generation");
            self.pipeline.stop_key_gen().await;
            self.board.set_processes(self.pipeline.processes());
        }
        tick
    }

    pub async fn run(mut self, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }
    }
}
