use std::sync::Arc;

use qkd_model::Epoch;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::trace;

const RECEIVED_CAPACITY: usize = 1024;

/// Epoch streams shared between the relay and the pipeline stages.
///
/// Received epochs fan out to whichever stage consumes partner files;
/// outgoing epochs are queued for the transfer program's command pipe.
#[derive(Clone)]
pub struct RelayTaps {
    received: broadcast::Sender<Epoch>,
    first_received: Arc<watch::Sender<Option<Epoch>>>,
    outgoing: mpsc::UnboundedSender<Epoch>,
}

impl RelayTaps {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Epoch>) {
        let (received, _) = broadcast::channel(RECEIVED_CAPACITY);
        let (first_received, _) = watch::channel(None);
        let (outgoing, rx) = mpsc::unbounded_channel();
        (
            Self {
                received,
                first_received: Arc::new(first_received),
                outgoing,
            },
            rx,
        )
    }

    pub fn subscribe_received(&self) -> broadcast::Receiver<Epoch> {
        self.received.subscribe()
    }

    /// First epoch received from the partner since the last reset.
    pub fn first_received(&self) -> watch::Receiver<Option<Epoch>> {
        self.first_received.subscribe()
    }

    pub fn reset_first_received(&self) {
        self.first_received.send_replace(None);
    }

    /// Ask the transfer program to ship the file for `epoch`.
    pub fn send_epoch(&self, epoch: Epoch) {
        if self.outgoing.send(epoch).is_err() {
            trace!(target: "qkd.core.relay", %epoch, "transfer command pipe closed; epoch dropped");
        }
    }

    pub(crate) fn publish_received(&self, epoch: Epoch) {
        self.first_received.send_if_modified(|first| {
            if first.is_none() {
                *first = Some(epoch);
                true
            } else {
                false
            }
        });
        // No subscribers outside a running pipeline.
        let _ = self.received.send(epoch);
    }
}
