use async_trait::async_trait;
use qkd_core::Subscribe;
use qkd_model::LinkEvent;

use crate::subscriber::view::log_event;

/// Writes every controller event to the log.
#[derive(Debug, Default)]
pub struct Journal;

impl Journal {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for Journal {
    async fn on_event(&self, event: &LinkEvent) {
        log_event(event);
    }
    fn name(&self) -> &'static str {
        "journal"
    }
    fn queue_capacity(&self) -> usize {
        2048
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use qkd_core::EventBus;
    use qkd_model::{ConnectionStatus, Message};

    use super::*;

    #[tokio::test]
    async fn journal_drains_bus_events() {
        let bus = EventBus::new(vec![Arc::new(Journal::new())]);
        bus.publish(&LinkEvent::ConnectionChanged(ConnectionStatus::Connected));
        bus.publish(&LinkEvent::Message(Message::St1));
        bus.shutdown().await;
    }
}
