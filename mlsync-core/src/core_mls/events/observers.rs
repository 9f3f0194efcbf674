//! Observer registry
//!
//! Publish/subscribe for [`GroupEvent`]s. Each subscriber gets its own
//! unbounded channel, so events arrive in emission order per observer and a
//! slow observer never drops events for the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::GroupEvent;

/// Opaque handle returned by [`ObserverRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

/// A live subscription
pub struct Subscription {
    pub token: ObserverToken,
    pub events: mpsc::UnboundedReceiver<GroupEvent>,
}

#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: Mutex<HashMap<ObserverToken, mpsc::UnboundedSender<GroupEvent>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let token = ObserverToken(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(token, tx);
        Subscription { token, events: rx }
    }

    /// Returns false if the token was unknown
    pub fn unsubscribe(&self, token: ObserverToken) -> bool {
        self.lock().remove(&token).is_some()
    }

    /// Deliver `event` to every observer; returns the number reached
    pub fn emit(&self, event: GroupEvent) -> usize {
        let mut observers = self.lock();
        // Receivers dropped without unsubscribing are pruned here.
        observers.retain(|_, tx| tx.send(event.clone()).is_ok());
        observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ObserverToken, mpsc::UnboundedSender<GroupEvent>>> {
        // A poisoned map is still structurally valid.
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(id: &str) -> GroupEvent {
        GroupEvent::ConversationCreated {
            conversation_id: id.to_string(),
            epoch: 0,
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_emission_order() {
        let registry = ObserverRegistry::new();
        let mut sub = registry.subscribe();

        registry.emit(created("a"));
        registry.emit(GroupEvent::SyncCompleted { count: 2 });
        registry.emit(created("b"));

        assert_eq!(sub.events.recv().await.unwrap(), created("a"));
        assert_eq!(
            sub.events.recv().await.unwrap(),
            GroupEvent::SyncCompleted { count: 2 }
        );
        assert_eq!(sub.events.recv().await.unwrap(), created("b"));
    }

    #[tokio::test]
    async fn test_unsubscribe_by_token() {
        let registry = ObserverRegistry::new();
        let first = registry.subscribe();
        let mut second = registry.subscribe();
        assert_ne!(first.token, second.token);
        assert_eq!(registry.observer_count(), 2);

        assert!(registry.unsubscribe(first.token));
        assert!(!registry.unsubscribe(first.token));

        assert_eq!(registry.emit(created("c")), 1);
        assert_eq!(second.events.recv().await.unwrap(), created("c"));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned() {
        let registry = ObserverRegistry::new();
        {
            let _sub = registry.subscribe();
        }
        assert_eq!(registry.emit(created("d")), 0);
        assert_eq!(registry.observer_count(), 0);
    }
}
