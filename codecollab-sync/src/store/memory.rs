//! In-memory stores for tests and single-process embedding.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{PresenceStore, SessionStore};
use crate::channel::{ChangeEvent, EventSink};
use crate::error::SyncError;
use crate::model::{Participant, Session, SessionId, SessionPatch, Timestamp, UserId};

/// Session store backed by a map.
///
/// Every accepted update bumps `updated_at` by one and, when a sink is
/// attached, publishes `SessionChanged` with the new snapshot.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    sink: Option<Arc<dyn EventSink>>,
    write_log: RwLock<Vec<(SessionId, SessionPatch)>>,
    fail_writes: AtomicBool,
    reads: AtomicU64,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            sink: None,
            write_log: RwLock::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            reads: AtomicU64::new(0),
        }
    }

    /// Publish accepted writes to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Seed or replace a session record.
    pub async fn insert(&self, session: Session) {
        self.sessions.write().await.insert(session.id, session);
    }

    /// Make subsequent updates fail with `StoreWrite` (fault injection).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every accepted patch, in acceptance order.
    pub async fn write_log(&self) -> Vec<(SessionId, SessionPatch)> {
        self.write_log.read().await.clone()
    }

    /// Number of accepted writes for one session.
    pub async fn write_count(&self, id: SessionId) -> usize {
        self.write_log.read().await.iter().filter(|(sid, _)| *sid == id).count()
    }

    /// Number of `get_session` calls served.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, SyncError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn update_session(
        &self,
        id: SessionId,
        patch: SessionPatch,
    ) -> Result<Session, SyncError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::StoreWrite(format!("write to session {id} rejected")));
        }

        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(&id).ok_or(SyncError::NotFound(id))?;
            session.apply(&patch);
            session.updated_at += 1;
            session.clone()
        };
        self.write_log.write().await.push((id, patch));
        log::trace!("Session {id} accepted write v{}", snapshot.updated_at);

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.publish(ChangeEvent::session_changed(snapshot.clone())).await {
                log::warn!("Failed to publish change for session {id}: {e}");
            }
        }
        Ok(snapshot)
    }
}

/// Presence store backed by insertion-ordered maps.
///
/// Publishes `PresenceChanged` when the roster's membership or a display
/// name changes. Plain `last_seen` refreshes are silent; expiry is observed
/// by re-querying.
pub struct MemoryPresenceStore {
    sessions: RwLock<HashMap<SessionId, IndexMap<UserId, Participant>>>,
    sink: Option<Arc<dyn EventSink>>,
    fail_writes: AtomicBool,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            sink: None,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Make subsequent upserts and deletes fail with `StoreWrite`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// All records for a session regardless of liveness.
    pub async fn all_participants(&self, session_id: SessionId) -> Vec<Participant> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .map(|roster| roster.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn announce(&self, session_id: SessionId) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.publish(ChangeEvent::presence_changed(session_id)).await {
                log::warn!("Failed to publish presence change for session {session_id}: {e}");
            }
        }
    }

    fn check_writable(&self) -> Result<(), SyncError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::StoreWrite("presence store unavailable".into()));
        }
        Ok(())
    }
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn upsert_participant(
        &self,
        session_id: SessionId,
        user_id: UserId,
        display_name: &str,
        color: &str,
        last_seen: Timestamp,
    ) -> Result<(), SyncError> {
        self.check_writable()?;

        let changed = {
            let mut sessions = self.sessions.write().await;
            let roster = sessions.entry(session_id).or_default();
            match roster.get_mut(&user_id) {
                Some(existing) => {
                    let renamed = existing.display_name != display_name;
                    existing.display_name = display_name.to_string();
                    existing.color = color.to_string();
                    existing.last_seen = last_seen;
                    renamed
                }
                None => {
                    roster.insert(
                        user_id,
                        Participant {
                            session_id,
                            user_id,
                            display_name: display_name.to_string(),
                            color: color.to_string(),
                            last_seen,
                        },
                    );
                    true
                }
            }
        };

        if changed {
            self.announce(session_id).await;
        }
        Ok(())
    }

    async fn delete_participant(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<(), SyncError> {
        self.check_writable()?;

        let removed = {
            let mut sessions = self.sessions.write().await;
            let removed = sessions
                .get_mut(&session_id)
                .and_then(|roster| roster.shift_remove(&user_id))
                .is_some();
            if sessions.get(&session_id).is_some_and(|roster| roster.is_empty()) {
                sessions.remove(&session_id);
            }
            removed
        };

        if removed {
            self.announce(session_id).await;
        }
        Ok(())
    }

    async fn query_participants(
        &self,
        session_id: SessionId,
        since: Timestamp,
    ) -> Result<Vec<Participant>, SyncError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(&session_id)
            .map(|roster| {
                roster
                    .values()
                    .filter(|p| p.last_seen >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
