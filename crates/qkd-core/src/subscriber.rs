//! Fan-out of link events to observers.
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use qkd_model::LinkEvent;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::warn;

/// Observer of controller events.
///
/// Each subscriber gets its own bounded queue and worker task, so a slow one never stalls the controller.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    async fn on_event(&self, event: &LinkEvent);

    fn name(&self) -> &'static str;

    fn queue_capacity(&self) -> usize {
        1024
    }
}

struct Lane {
    name: &'static str,
    tx: mpsc::Sender<LinkEvent>,
}

#[derive(Default)]
pub struct EventBus {
    lanes: RwLock<Vec<Lane>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        let mut lanes = Vec::with_capacity(subscribers.len());
        let mut workers = Vec::with_capacity(subscribers.len());
        for sub in subscribers {
            let name = sub.name();
            let (tx, mut rx) = mpsc::channel::<LinkEvent>(sub.queue_capacity().max(1));
            workers.push(tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    sub.on_event(&ev).await;
                }
            }));
            lanes.push(Lane { name, tx });
        }
        Self {
            lanes: RwLock::new(lanes),
            workers: Mutex::new(workers),
        }
    }

    pub fn publish(&self, event: &LinkEvent) {
        let lanes = self.lanes.read().unwrap_or_else(PoisonError::into_inner);
        for lane in lanes.iter() {
            if lane.tx.try_send(event.clone()).is_err() {
                warn!(target: "qkd.core.events", subscriber = lane.name, "event dropped for subscriber");
            }
        }
    }

    /// Close every lane and wait for queued events to be handled.
    pub async fn shutdown(&self) {
        self.lanes.write().unwrap_or_else(PoisonError::into_inner).clear();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for w in workers {
            let _ = w.await;
        }
    }
}
