//! Subscription hub over the notification channel.
//!
//! The transport delivers at-least-once and may reorder across hops.
//! [`SessionFeed`] absorbs both: a `SessionChanged` whose snapshot version
//! is not newer than the last one delivered on the same feed is dropped.
//! `PresenceChanged` carries no version and is always forwarded; its
//! handling (a full roster re-query) is idempotent anyway.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::channel::{
    ChangeEvent, EventFilter, EventStream, NotificationChannel, SubscriptionId,
};
use crate::error::SyncError;
use crate::model::SessionId;

/// Drops duplicate and out-of-order session snapshots.
#[derive(Debug, Clone, Default)]
pub struct StaleFilter {
    last_version: Option<u64>,
    dropped: u64,
}

impl StaleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `event` should be delivered. Updates the high-water mark.
    pub fn admit(&mut self, event: &ChangeEvent) -> bool {
        match event {
            ChangeEvent::SessionChanged { snapshot, .. } => {
                if self.last_version.is_some_and(|v| snapshot.updated_at <= v) {
                    self.dropped += 1;
                    return false;
                }
                self.last_version = Some(snapshot.updated_at);
                true
            }
            ChangeEvent::PresenceChanged { .. } => true,
        }
    }

    /// Number of events rejected so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Pull-side view of one subscription.
///
/// Releasing it with [`close`](Self::close) unsubscribes from the channel.
/// A feed dropped without closing schedules the unsubscribe on the current
/// runtime.
pub struct SessionFeed {
    session_id: SessionId,
    id: SubscriptionId,
    events: EventStream,
    filter: StaleFilter,
    channel: Arc<dyn NotificationChannel>,
    closed: bool,
}

impl SessionFeed {
    /// Next admitted event, or `None` once the underlying stream has ended.
    ///
    /// Cancel safe.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            let event = self.events.next().await?;
            if event.session_id() != self.session_id {
                log::debug!("Feed {} ignoring event for session {}", self.id, event.session_id());
                continue;
            }
            if self.filter.admit(&event) {
                return Some(event);
            }
            log::trace!("Feed {} dropped a stale or duplicate snapshot", self.id);
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Stale or duplicate snapshots dropped on this feed.
    pub fn dropped(&self) -> u64 {
        self.filter.dropped()
    }

    /// Unsubscribe from the channel.
    pub async fn close(mut self) -> Result<(), SyncError> {
        self.closed = true;
        self.channel.unsubscribe(self.id).await
    }
}

impl Drop for SessionFeed {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let channel = self.channel.clone();
            let id = self.id;
            handle.spawn(async move {
                if let Err(e) = channel.unsubscribe(id).await {
                    log::warn!("Failed to release dropped feed {id}: {e}");
                }
            });
        }
    }
}

/// Hub-level handle for a callback subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct ListenerEntry {
    channel_id: SubscriptionId,
    task: JoinHandle<()>,
}

/// Delivers session-scoped change events to interested listeners.
pub struct ChangeBroadcaster {
    channel: Arc<dyn NotificationChannel>,
    listeners: Mutex<HashMap<SubscriptionHandle, ListenerEntry>>,
    next_handle: AtomicU64,
}

impl ChangeBroadcaster {
    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        Self {
            channel,
            listeners: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Open a pull-style feed. Delivery starts now; nothing is replayed.
    pub async fn open(
        &self,
        session_id: SessionId,
        filter: EventFilter,
    ) -> Result<SessionFeed, SyncError> {
        let subscription = self.channel.subscribe(session_id, filter).await?;
        log::debug!("Opened feed {} for session {session_id}", subscription.id);
        Ok(SessionFeed {
            session_id,
            id: subscription.id,
            events: subscription.events,
            filter: StaleFilter::new(),
            channel: self.channel.clone(),
            closed: false,
        })
    }

    /// Register a callback for every event class of a session.
    pub async fn subscribe<F>(
        &self,
        session_id: SessionId,
        listener: F,
    ) -> Result<SubscriptionHandle, SyncError>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        self.subscribe_filtered(session_id, EventFilter::ALL, listener).await
    }

    /// Register a callback for the event classes selected by `filter`.
    ///
    /// The callback may run more than once for the same logical change.
    pub async fn subscribe_filtered<F>(
        &self,
        session_id: SessionId,
        filter: EventFilter,
        mut listener: F,
    ) -> Result<SubscriptionHandle, SyncError>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let mut feed = self.open(session_id, filter).await?;
        let channel_id = feed.id();
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));

        let task = tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                listener(event);
            }
            log::debug!("Feed {} for session {} ended", feed.id(), feed.session_id());
        });

        self.listeners
            .lock()
            .await
            .insert(handle, ListenerEntry { channel_id, task });
        Ok(handle)
    }

    /// Stop delivery to a callback. Idempotent, and safe after the channel
    /// has already closed.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), SyncError> {
        let Some(entry) = self.listeners.lock().await.remove(&handle) else {
            return Ok(());
        };
        entry.task.abort();
        self.channel.unsubscribe(entry.channel_id).await
    }

    /// Number of registered callbacks.
    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }

    pub fn channel(&self) -> &Arc<dyn NotificationChannel> {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::LocalHub;
    use crate::model::Session;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn snapshot(id: SessionId, version: u64, code: &str) -> ChangeEvent {
        let mut session = Session::new(id, "Demo").with_code(code);
        session.updated_at = version;
        ChangeEvent::session_changed(session)
    }

    #[test]
    fn test_stale_filter_drops_duplicates_and_older() {
        let id = Uuid::new_v4();
        let mut filter = StaleFilter::new();

        assert!(filter.admit(&snapshot(id, 2, "b")));
        assert!(!filter.admit(&snapshot(id, 2, "b")));
        assert!(!filter.admit(&snapshot(id, 1, "a")));
        assert!(filter.admit(&snapshot(id, 3, "c")));
        assert!(filter.admit(&ChangeEvent::presence_changed(id)));
        assert!(filter.admit(&ChangeEvent::presence_changed(id)));
        assert_eq!(filter.dropped(), 2);
    }

    #[tokio::test]
    async fn test_feed_delivers_and_filters() {
        let hub = Arc::new(LocalHub::new(16));
        let broadcaster = ChangeBroadcaster::new(hub.clone());
        let id = Uuid::new_v4();

        let mut feed = broadcaster.open(id, EventFilter::ALL).await.unwrap();
        hub.send(snapshot(id, 1, "a")).await;
        hub.send(snapshot(id, 1, "a")).await;
        hub.send(snapshot(id, 2, "ab")).await;

        assert_eq!(feed.next().await, Some(snapshot(id, 1, "a")));
        assert_eq!(feed.next().await, Some(snapshot(id, 2, "ab")));
        assert_eq!(feed.dropped(), 1);

        feed.close().await.unwrap();
        assert_eq!(hub.subscriber_count(&id).await, 0);
    }

    #[tokio::test]
    async fn test_callback_subscription() {
        let hub = Arc::new(LocalHub::new(16));
        let broadcaster = ChangeBroadcaster::new(hub.clone());
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = broadcaster
            .subscribe(id, move |event| {
                let _ = tx.send(event);
            })
            .await
            .unwrap();
        assert_eq!(broadcaster.listener_count().await, 1);

        hub.send(ChangeEvent::presence_changed(id)).await;
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(received, Some(ChangeEvent::presence_changed(id)));

        broadcaster.unsubscribe(handle).await.unwrap();
        broadcaster.unsubscribe(handle).await.unwrap();
        assert_eq!(broadcaster.listener_count().await, 0);
        assert_eq!(hub.subscriber_count(&id).await, 0);
    }

    #[tokio::test]
    async fn test_no_replay_of_past_events() {
        let hub = Arc::new(LocalHub::new(16));
        let broadcaster = ChangeBroadcaster::new(hub.clone());
        let id = Uuid::new_v4();

        let _early = broadcaster.open(id, EventFilter::ALL).await.unwrap();
        hub.send(snapshot(id, 1, "before")).await;

        let mut late = broadcaster.open(id, EventFilter::ALL).await.unwrap();
        hub.send(snapshot(id, 2, "after")).await;
        assert_eq!(late.next().await, Some(snapshot(id, 2, "after")));
    }

    #[tokio::test]
    async fn test_unsubscribe_after_channel_closed() {
        let hub = Arc::new(LocalHub::new(16));
        let broadcaster = ChangeBroadcaster::new(hub.clone());
        let id = Uuid::new_v4();

        let handle = broadcaster.subscribe(id, |_| {}).await.unwrap();
        // First subscription on a fresh hub; release it as a transport drop would.
        hub.unsubscribe(SubscriptionId(1)).await.unwrap();
        assert!(broadcaster.unsubscribe(handle).await.is_ok());
    }
}
