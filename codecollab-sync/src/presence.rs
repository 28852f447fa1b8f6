//! Presence tracking: who is in a session and whether they are still alive.
//!
//! ## Lifecycle
//!
//! ```text
//! attach ──► join() ──► heartbeat() every 30s ──► leave() on any exit path
//!                              │
//!                              ▼
//!                   PresenceStore.last_seen = now
//!
//! list_active(now, window) = { p | p.last_seen >= now - window }
//! ```
//!
//! Liveness is purely timestamp based. A client that vanishes without
//! calling `leave()` drops out of every roster once its `last_seen` falls
//! outside the presence window (5 minutes by default).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::SyncError;
use crate::model::{
    window_start, Clock, Participant, SessionId, SystemClock, Timestamp, UserId,
};
use crate::store::PresenceStore;

/// Fixed avatar palette. Collisions between users are expected once it is
/// exhausted.
pub const PALETTE: [&str; 10] = [
    "#3b82f6", // blue
    "#ef4444", // red
    "#10b981", // emerald
    "#f59e0b", // amber
    "#8b5cf6", // violet
    "#ec4899", // pink
    "#14b8a6", // teal
    "#f97316", // orange
    "#6366f1", // indigo
    "#84cc16", // lime
];

/// Stable color for a user, derived from the UUID bits alone.
///
/// Same input always yields the same entry, in every process, so a
/// reconnecting user keeps their visual identity without coordination.
pub fn color_of(user_id: UserId) -> &'static str {
    let hash = user_id.as_u128();
    PALETTE[(hash % PALETTE.len() as u128) as usize]
}

/// A roster row as the UI shows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub participant: Participant,
    /// Whether this row is the local user ("You").
    pub is_current_user: bool,
}

/// Tag roster rows with whether they belong to `current_user`.
pub fn build_roster(participants: Vec<Participant>, current_user: UserId) -> Vec<RosterEntry> {
    participants
        .into_iter()
        .map(|participant| RosterEntry {
            is_current_user: participant.user_id == current_user,
            participant,
        })
        .collect()
}

/// Joins, refreshes and removes participants, and computes active rosters.
///
/// Remembers the participants it joined so that a heartbeat can refresh a
/// record without the caller resupplying display name and color.
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    clock: Arc<dyn Clock>,
    /// Held across every store write, so an upsert and a delete for the
    /// same participant never interleave.
    joined: RwLock<HashMap<(SessionId, UserId), Participant>>,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PresenceStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            joined: RwLock::new(HashMap::new()),
        }
    }

    /// Tracker reading wall-clock time.
    pub fn with_system_clock(store: Arc<dyn PresenceStore>) -> Self {
        Self::new(store, Arc::new(SystemClock))
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Insert or refresh the participant record with `last_seen = now`.
    ///
    /// The participant is remembered even if the store write fails, so the
    /// next heartbeat retries it.
    pub async fn join(
        &self,
        session_id: SessionId,
        user_id: UserId,
        display_name: &str,
    ) -> Result<Participant, SyncError> {
        let participant = Participant {
            session_id,
            user_id,
            display_name: display_name.to_string(),
            color: color_of(user_id).to_string(),
            last_seen: self.clock.now(),
        };
        let mut joined = self.joined.write().await;
        joined.insert((session_id, user_id), participant.clone());
        self.upsert(&participant).await?;
        drop(joined);

        log::info!("{display_name} ({user_id}) joined session {session_id}");
        Ok(participant)
    }

    /// Refresh `last_seen` for a participant joined through this tracker.
    pub async fn heartbeat(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<Participant, SyncError> {
        let mut joined = self.joined.write().await;
        let entry = joined
            .get_mut(&(session_id, user_id))
            .ok_or(SyncError::NotJoined)?;
        entry.last_seen = self.clock.now();
        let participant = entry.clone();
        self.upsert(&participant).await?;
        drop(joined);

        log::trace!("Heartbeat for {user_id} in session {session_id}");
        Ok(participant)
    }

    /// Delete the participant record.
    pub async fn leave(&self, session_id: SessionId, user_id: UserId) -> Result<(), SyncError> {
        let mut joined = self.joined.write().await;
        joined.remove(&(session_id, user_id));
        self.store.delete_participant(session_id, user_id).await?;
        drop(joined);

        log::info!("{user_id} left session {session_id}");
        Ok(())
    }

    /// Participants seen within `window` of `now`, boundary inclusive, in
    /// first-seen order.
    pub async fn list_active(
        &self,
        session_id: SessionId,
        now: Timestamp,
        window: Duration,
    ) -> Result<Vec<Participant>, SyncError> {
        let since = window_start(now, window);
        let mut participants = self.store.query_participants(session_id, since).await?;
        participants.retain(|p| p.last_seen >= since);
        Ok(participants)
    }

    /// [`list_active`](Self::list_active) at the tracker's current time.
    pub async fn list_active_now(
        &self,
        session_id: SessionId,
        window: Duration,
    ) -> Result<Vec<Participant>, SyncError> {
        self.list_active(session_id, self.clock.now(), window).await
    }

    /// Whether this tracker currently holds a join for (session, user).
    pub async fn is_joined(&self, session_id: SessionId, user_id: UserId) -> bool {
        self.joined.read().await.contains_key(&(session_id, user_id))
    }

    async fn upsert(&self, participant: &Participant) -> Result<(), SyncError> {
        self.store
            .upsert_participant(
                participant.session_id,
                participant.user_id,
                &participant.display_name,
                &participant.color,
                participant.last_seen,
            )
            .await
            .inspect_err(|e| {
                log::warn!(
                    "Presence upsert for {} in session {} failed: {e}",
                    participant.user_id,
                    participant.session_id
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ManualClock;
    use crate::store::MemoryPresenceStore;
    use async_trait::async_trait;
    use uuid::Uuid;

    const WINDOW: Duration = Duration::from_secs(300);

    /// Store whose upserts take `delay` to land.
    struct SlowUpserts {
        inner: MemoryPresenceStore,
        delay: Duration,
    }

    #[async_trait]
    impl PresenceStore for SlowUpserts {
        async fn upsert_participant(
            &self,
            session_id: SessionId,
            user_id: UserId,
            display_name: &str,
            color: &str,
            last_seen: Timestamp,
        ) -> Result<(), SyncError> {
            tokio::time::sleep(self.delay).await;
            self.inner
                .upsert_participant(session_id, user_id, display_name, color, last_seen)
                .await
        }

        async fn delete_participant(
            &self,
            session_id: SessionId,
            user_id: UserId,
        ) -> Result<(), SyncError> {
            self.inner.delete_participant(session_id, user_id).await
        }

        async fn query_participants(
            &self,
            session_id: SessionId,
            since: Timestamp,
        ) -> Result<Vec<Participant>, SyncError> {
            self.inner.query_participants(session_id, since).await
        }
    }

    fn tracker_at(start: Timestamp) -> (PresenceTracker, Arc<MemoryPresenceStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryPresenceStore::new());
        let clock = Arc::new(ManualClock::new(start));
        let tracker = PresenceTracker::new(store.clone(), clock.clone());
        (tracker, store, clock)
    }

    #[test]
    fn test_color_of_is_deterministic() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(color_of(id), color_of(id));
        assert!(PALETTE.contains(&color_of(id)));
    }

    #[test]
    fn test_color_of_known_value() {
        // 0x...0000 % 10 == 0 → first palette entry on every platform.
        assert_eq!(color_of(Uuid::nil()), PALETTE[0]);
        assert_eq!(color_of(Uuid::from_u128(13)), PALETTE[3]);
    }

    #[test]
    fn test_build_roster_marks_current_user() {
        let session_id = Uuid::new_v4();
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let participants = vec![
            Participant {
                session_id,
                user_id: other,
                display_name: "Alice".into(),
                color: color_of(other).into(),
                last_seen: 1,
            },
            Participant {
                session_id,
                user_id: me,
                display_name: "Me".into(),
                color: color_of(me).into(),
                last_seen: 1,
            },
        ];

        let roster = build_roster(participants, me);
        assert!(!roster[0].is_current_user);
        assert!(roster[1].is_current_user);
    }

    #[tokio::test]
    async fn test_join_twice_keeps_one_record() {
        let (tracker, store, clock) = tracker_at(1_000);
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        tracker.join(session_id, user_id, "Alice").await.unwrap();
        clock.set(5_000);
        let second = tracker.join(session_id, user_id, "Alice").await.unwrap();

        let all = store.all_participants(session_id).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_seen, 5_000);
        assert_eq!(second.last_seen, 5_000);
        assert_eq!(all[0].color, color_of(user_id));
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_last_seen() {
        let (tracker, store, clock) = tracker_at(1_000);
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        tracker.join(session_id, user_id, "Alice").await.unwrap();
        clock.advance(Duration::from_secs(30));
        tracker.heartbeat(session_id, user_id).await.unwrap();

        let all = store.all_participants(session_id).await;
        assert_eq!(all[0].last_seen, 31_000);
        assert_eq!(all[0].display_name, "Alice");
    }

    #[tokio::test]
    async fn test_heartbeat_without_join() {
        let (tracker, _store, _clock) = tracker_at(0);
        let err = tracker.heartbeat(Uuid::new_v4(), Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, SyncError::NotJoined);
    }

    #[tokio::test]
    async fn test_failed_join_is_retried_by_heartbeat() {
        let (tracker, store, clock) = tracker_at(1_000);
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        store.set_fail_writes(true);
        assert!(tracker.join(session_id, user_id, "Alice").await.is_err());
        assert!(tracker.is_joined(session_id, user_id).await);

        store.set_fail_writes(false);
        clock.advance(Duration::from_secs(30));
        tracker.heartbeat(session_id, user_id).await.unwrap();
        assert_eq!(store.all_participants(session_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_list_active_window_boundary() {
        let (tracker, store, _clock) = tracker_at(0);
        let session_id = Uuid::new_v4();
        let now = 1_000_000;
        let edge = Uuid::new_v4();
        let stale = Uuid::new_v4();

        store
            .upsert_participant(session_id, edge, "Edge", "#1", now - 300_000)
            .await
            .unwrap();
        store
            .upsert_participant(session_id, stale, "Stale", "#2", now - 300_001)
            .await
            .unwrap();

        let active = tracker.list_active(session_id, now, WINDOW).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, edge);
    }

    #[tokio::test]
    async fn test_leave_removes_from_active() {
        let (tracker, _store, clock) = tracker_at(10_000);
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        tracker.join(session_id, user_id, "Alice").await.unwrap();
        tracker.leave(session_id, user_id).await.unwrap();

        let active = tracker.list_active(session_id, clock.now(), WINDOW).await.unwrap();
        assert!(active.iter().all(|p| p.user_id != user_id));
        assert!(!tracker.is_joined(session_id, user_id).await);
    }

    #[tokio::test]
    async fn test_rejoin_keeps_color() {
        let (tracker, _store, _clock) = tracker_at(0);
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let first = tracker.join(session_id, user_id, "Alice").await.unwrap();
        tracker.leave(session_id, user_id).await.unwrap();
        let again = tracker.join(session_id, user_id, "Alice").await.unwrap();
        assert_eq!(first.color, again.color);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_waits_for_inflight_heartbeat() {
        let store = Arc::new(SlowUpserts {
            inner: MemoryPresenceStore::new(),
            delay: Duration::from_millis(100),
        });
        let tracker = Arc::new(PresenceTracker::new(store.clone(), Arc::new(ManualClock::new(0))));
        let session_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        tracker.join(session_id, user_id, "Alice").await.unwrap();

        let heartbeat = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.heartbeat(session_id, user_id).await }
        });
        // Leave while the heartbeat upsert is still sleeping in the store.
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.leave(session_id, user_id).await.unwrap();

        assert!(heartbeat.await.unwrap().is_ok());
        assert!(store.inner.all_participants(session_id).await.is_empty());
        assert_eq!(
            tracker.heartbeat(session_id, user_id).await.unwrap_err(),
            SyncError::NotJoined
        );
        assert!(store.inner.all_participants(session_id).await.is_empty());
    }
}
