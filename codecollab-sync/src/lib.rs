//! # codecollab-sync — Real-time sync engine for collaborative code sessions
//!
//! Keeps every participant's editor showing the same document, tracks who
//! is present, and propagates changes through an external publish/subscribe
//! channel. Concurrent writers converge by last-writer-wins on the whole
//! document, ordered by the store-assigned `updated_at` version.
//!
//! ## Architecture
//!
//! ```text
//!   ┌────────────────────┐  debounced whole-doc write  ┌──────────────┐
//!   │ SyncController     │ ──────────────────────────► │ SessionStore │
//!   │ (per client)       │                             └──────┬───────┘
//!   │  buffer · debounce │  join / heartbeat / leave   ┌──────┴────────┐
//!   │  heartbeat · feed  │ ──────► PresenceTracker ──► │ PresenceStore │
//!   └─────────▲──────────┘                             └──────┬────────┘
//!             │ SessionChanged / PresenceChanged              │ publish
//!   ┌─────────┴──────────┐    ┌──────────────────────┐        │
//!   │ ChangeBroadcaster  │ ◄──│ NotificationChannel  │ ◄──────┘
//!   │ (stale filter)     │    │ LocalHub / Relay     │
//!   └────────────────────┘    └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`] — Session, Participant, Language, clocks
//! - [`store`] — store interfaces plus in-memory implementations
//! - [`channel`] — change events and the pub/sub interfaces
//! - [`hub`] — in-process notification channel
//! - [`presence`] — join/heartbeat/leave and active rosters
//! - [`broadcast`] — session-scoped subscription hub
//! - [`controller`] — per-client sync orchestrator
//! - [`relay`] — WebSocket notification relay (server and client)

pub mod broadcast;
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod hub;
pub mod model;
pub mod presence;
pub mod relay;
pub mod store;

// Re-exports for convenience
pub use broadcast::{ChangeBroadcaster, SessionFeed, StaleFilter, SubscriptionHandle};
pub use channel::{
    ChangeEvent, EventFilter, EventSink, EventStream, NotificationChannel, Subscription,
    SubscriptionId,
};
pub use config::{Backoff, BackoffConfig, SyncConfig};
pub use controller::{
    ControllerView, DocumentBuffer, LocalUser, SyncContext, SyncController, SyncEvent, SyncState,
};
pub use error::SyncError;
pub use hub::{HubStats, LocalHub};
pub use model::{
    Clock, Language, ManualClock, Participant, Session, SessionId, SessionPatch, SystemClock,
    Timestamp, UserId,
};
pub use presence::{color_of, PresenceTracker, RosterEntry, PALETTE};
pub use relay::{RelayChannel, RelayConfig, RelayServer};
pub use store::{MemoryPresenceStore, MemorySessionStore, PresenceStore, SessionStore};
