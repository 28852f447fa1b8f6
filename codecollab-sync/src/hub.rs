//! In-process notification channel: one broadcast room per session.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers of a
//! session. Each subscription gets an independent receiver buffering up to
//! `capacity` events. A receiver that falls further behind than that ends
//! its stream instead of silently skipping events; subscribers treat the
//! end as a dropped subscription and resubscribe.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, RwLock};

use crate::channel::{
    ChangeEvent, EventFilter, EventSink, NotificationChannel, Subscription, SubscriptionId,
};
use crate::error::SyncError;
use crate::model::SessionId;

/// Statistics for monitoring hub health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub events_published: u64,
    pub events_delivered: u64,
    pub active_rooms: usize,
    pub active_subscriptions: usize,
}

struct SubscriptionEntry {
    session_id: SessionId,
    /// Dropping or firing this ends the subscriber's stream.
    cancel: oneshot::Sender<()>,
}

/// Session-keyed fan-out hub.
///
/// Implements both [`NotificationChannel`] and [`EventSink`], so stores and
/// controllers living in one process can share it directly.
pub struct LocalHub {
    rooms: RwLock<HashMap<SessionId, broadcast::Sender<ChangeEvent>>>,
    subscriptions: RwLock<HashMap<SubscriptionId, SubscriptionEntry>>,
    capacity: usize,
    next_id: AtomicU64,
    events_published: AtomicU64,
    events_delivered: AtomicU64,
}

impl LocalHub {
    /// Create a hub whose rooms buffer `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            events_published: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
        }
    }

    /// Get or create the room sender for a session.
    async fn room(&self, session_id: SessionId) -> broadcast::Sender<ChangeEvent> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(sender) = rooms.get(&session_id) {
                return sender.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Fan an event out to every subscriber of its session.
    ///
    /// Returns the number of receivers the event was handed to.
    pub async fn send(&self, event: ChangeEvent) -> usize {
        let sender = {
            let rooms = self.rooms.read().await;
            rooms.get(&event.session_id()).cloned()
        };
        self.events_published.fetch_add(1, Ordering::Relaxed);

        let Some(sender) = sender else {
            log::trace!("No room for session {}, event dropped", event.session_id());
            return 0;
        };
        let session_id = event.session_id();
        let count = sender.send(event).unwrap_or(0);
        if count == 0 {
            // Streams released or dropped without unsubscribing leave rooms behind.
            self.remove_if_empty(&session_id).await;
        }
        self.events_delivered.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Number of live subscriptions for a session.
    pub async fn subscriber_count(&self, session_id: &SessionId) -> usize {
        self.subscriptions
            .read()
            .await
            .values()
            .filter(|entry| entry.session_id == *session_id)
            .count()
    }

    /// Number of sessions with a room.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Get the per-subscriber buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            active_rooms: self.rooms.read().await.len(),
            active_subscriptions: self.subscriptions.read().await.len(),
        }
    }

    /// Drop a session's room once nobody listens to it.
    async fn remove_if_empty(&self, session_id: &SessionId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(sender) = rooms.get(session_id) {
            if sender.receiver_count() == 0 {
                rooms.remove(session_id);
                return true;
            }
        }
        false
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

struct StreamState {
    rx: broadcast::Receiver<ChangeEvent>,
    cancel: oneshot::Receiver<()>,
    filter: EventFilter,
    id: SubscriptionId,
}

#[async_trait]
impl NotificationChannel for LocalHub {
    async fn subscribe(
        &self,
        session_id: SessionId,
        filter: EventFilter,
    ) -> Result<Subscription, SyncError> {
        let rx = self.room(session_id).await.subscribe();
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        self.subscriptions
            .write()
            .await
            .insert(id, SubscriptionEntry { session_id, cancel: cancel_tx });

        log::debug!("Subscription {id} opened for session {session_id}");

        let state = StreamState { rx, cancel: cancel_rx, filter, id };
        let events = futures_util::stream::unfold(state, |mut st| async move {
            loop {
                tokio::select! {
                    _ = &mut st.cancel => return None,
                    received = st.rx.recv() => match received {
                        Ok(event) => {
                            if st.filter.accepts(&event) {
                                return Some((event, st));
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Subscription {} lagged by {n} events, closing", st.id);
                            return None;
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Subscription { id, events: Box::pin(events) })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SyncError> {
        let entry = self.subscriptions.write().await.remove(&id);
        if let Some(entry) = entry {
            let _ = entry.cancel.send(());
            log::debug!("Subscription {id} released");
            self.remove_if_empty(&entry.session_id).await;
        }
        Ok(())
    }
}

#[async_trait]
impl EventSink for LocalHub {
    async fn publish(&self, event: ChangeEvent) -> Result<usize, SyncError> {
        Ok(self.send(event).await)
    }
}
