//! Fan-out of instance and node lifecycle events.
//!
//! The engine publishes while it interprets; the CLI subscribes before
//! submitting so the whole trail of a run is captured. Nobody listening is
//! fine.

use sce_types::event::EngineEvent;
use tokio::sync::broadcast;

#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        // Err only means no receiver is alive.
        let _ = self.sender.send(event);
    }
}
