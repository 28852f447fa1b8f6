//! Interfaces to the external durable stores.
//!
//! ```text
//! ┌────────────────┐  update_session   ┌──────────────┐  SessionChanged
//! │ SyncController │ ────────────────► │ SessionStore │ ───────────────► EventSink
//! └───────┬────────┘                   └──────────────┘
//!         │ join / heartbeat / leave   ┌───────────────┐ PresenceChanged
//!         └──────────────────────────► │ PresenceStore │ ──────────────► EventSink
//!                                      └───────────────┘
//! ```
//!
//! The core only reads and updates. Creating sessions and announcing
//! changes on the notification channel belong to the store side; the
//! in-memory implementations in [`memory`] do the latter through an
//! optional [`EventSink`](crate::channel::EventSink).

pub mod memory;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::model::{Participant, Session, SessionId, SessionPatch, Timestamp, UserId};

pub use memory::{MemoryPresenceStore, MemorySessionStore};

/// Durable holder of one [`Session`] per id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch the current snapshot, or `None` if the id does not resolve.
    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, SyncError>;

    /// Apply a partial update and return the accepted snapshot.
    ///
    /// The returned `updated_at` is strictly greater than any previously
    /// accepted version for this session.
    async fn update_session(&self, id: SessionId, patch: SessionPatch)
        -> Result<Session, SyncError>;
}

/// Durable holder of [`Participant`] records keyed by (session, user).
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert or refresh in place. Never creates a second record for the
    /// same (session, user).
    async fn upsert_participant(
        &self,
        session_id: SessionId,
        user_id: UserId,
        display_name: &str,
        color: &str,
        last_seen: Timestamp,
    ) -> Result<(), SyncError>;

    async fn delete_participant(&self, session_id: SessionId, user_id: UserId)
        -> Result<(), SyncError>;

    /// Participants with `last_seen >= since`, in first-seen order.
    async fn query_participants(
        &self,
        session_id: SessionId,
        since: Timestamp,
    ) -> Result<Vec<Participant>, SyncError>;
}
