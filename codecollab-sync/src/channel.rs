//! Change events and the publish/subscribe interfaces the core depends on.
//!
//! The transport itself is external. [`NotificationChannel`] is the
//! subscribe side, [`EventSink`] the publish side. Delivery is
//! at-least-once and not ordered across hops, so every consumer treats an
//! event as a trigger to apply an idempotent update.

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

use crate::error::SyncError;
use crate::model::{Session, SessionId};

/// A session-scoped change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// The session record changed; carries the accepted snapshot.
    SessionChanged {
        session_id: SessionId,
        snapshot: Session,
    },
    /// The presence roster changed; listeners re-query it.
    PresenceChanged { session_id: SessionId },
}

impl ChangeEvent {
    pub fn session_changed(snapshot: Session) -> Self {
        ChangeEvent::SessionChanged { session_id: snapshot.id, snapshot }
    }

    pub fn presence_changed(session_id: SessionId) -> Self {
        ChangeEvent::PresenceChanged { session_id }
    }

    /// Session this event is scoped to.
    pub fn session_id(&self) -> SessionId {
        match self {
            ChangeEvent::SessionChanged { session_id, .. } => *session_id,
            ChangeEvent::PresenceChanged { session_id } => *session_id,
        }
    }
}

/// Which event classes a subscription wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub session: bool,
    pub presence: bool,
}

impl EventFilter {
    pub const ALL: EventFilter = EventFilter { session: true, presence: true };
    pub const SESSION_ONLY: EventFilter = EventFilter { session: true, presence: false };
    pub const PRESENCE_ONLY: EventFilter = EventFilter { session: false, presence: true };

    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        match event {
            ChangeEvent::SessionChanged { .. } => self.session,
            ChangeEvent::PresenceChanged { .. } => self.presence,
        }
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::ALL
    }
}

/// Channel-level subscription handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lazy, possibly infinite, non-restartable event sequence.
pub type EventStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// A live registration returned by [`NotificationChannel::subscribe`].
///
/// The stream ends when the subscription is released or the transport
/// drops; it is never restarted. Resubscribe to continue.
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: EventStream,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Subscribe side of the external publish/subscribe transport.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Start receiving events for `session_id`. Past events are not replayed.
    async fn subscribe(
        &self,
        session_id: SessionId,
        filter: EventFilter,
    ) -> Result<Subscription, SyncError>;

    /// Release a subscription. Idempotent.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SyncError>;
}

/// Publish side of the transport. Stores use it to announce accepted writes.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Returns the number of subscribers the event was handed to, where the
    /// transport knows it.
    async fn publish(&self, event: ChangeEvent) -> Result<usize, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_event_session_id() {
        let session = Session::new(Uuid::new_v4(), "Demo");
        let id = session.id;
        assert_eq!(ChangeEvent::session_changed(session).session_id(), id);
        assert_eq!(ChangeEvent::presence_changed(id).session_id(), id);
    }

    #[test]
    fn test_filter_accepts() {
        let id = Uuid::new_v4();
        let session_evt = ChangeEvent::session_changed(Session::new(id, "Demo"));
        let presence_evt = ChangeEvent::presence_changed(id);

        assert!(EventFilter::ALL.accepts(&session_evt));
        assert!(EventFilter::ALL.accepts(&presence_evt));
        assert!(EventFilter::SESSION_ONLY.accepts(&session_evt));
        assert!(!EventFilter::SESSION_ONLY.accepts(&presence_evt));
        assert!(!EventFilter::PRESENCE_ONLY.accepts(&session_evt));
        assert!(EventFilter::PRESENCE_ONLY.accepts(&presence_evt));
    }

    #[test]
    fn test_subscription_id_display() {
        assert_eq!(SubscriptionId(7).to_string(), "sub-7");
    }
}
