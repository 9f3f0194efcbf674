//! Async test helpers

use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::core_mls::events::GroupEvent;

/// Default wait for an event that should already be queued
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Next event, or `None` if nothing arrives in time
pub async fn recv_event(rx: &mut mpsc::UnboundedReceiver<GroupEvent>) -> Option<GroupEvent> {
    timeout(EVENT_TIMEOUT, rx.recv()).await.ok().flatten()
}

/// Everything queued right now, without waiting
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<GroupEvent>) -> Vec<GroupEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
