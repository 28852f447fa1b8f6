//! Per-client sync controller.
//!
//! Owns the local document buffer, drives debounced writes, applies remote
//! snapshots, keeps the presence heartbeat going and runs the join/leave
//! lifecycle.
//!
//! ## State machine
//!
//! ```text
//! Disconnected ──attach()──► Loading ──found──► Synced ──leave()──► Disconnected
//!                               │                  │
//!                               └──not found──► Error (terminal)
//! ```
//!
//! ## Driver
//!
//! After a successful attach a single driver task owns all mutable state and
//! multiplexes, in one `select!` loop:
//!
//! ```text
//! commands (edit / language / save / leave)
//! debounce sleep        ── fires → whole-buffer write
//! heartbeat interval    ── fires → presence refresh + roster re-query
//! session feed          ── SessionChanged / PresenceChanged
//! reconnect sleep       ── fires → resubscribe
//! I/O completions       ── store calls are spawned and report back here
//! ```
//!
//! Store calls never block the loop, and no two handlers ever run at the
//! same time for one controller. Dropping the [`SyncController`] handle
//! closes the command channel; the driver then runs the same detach
//! sequence as [`SyncController::leave`].

use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};

use crate::broadcast::{ChangeBroadcaster, SessionFeed};
use crate::channel::{ChangeEvent, EventFilter};
use crate::config::{Backoff, SyncConfig};
use crate::error::SyncError;
use crate::model::{Language, Participant, Session, SessionId, SessionPatch, UserId};
use crate::presence::{build_roster, PresenceTracker, RosterEntry};
use crate::store::SessionStore;

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    Loading,
    Synced,
    /// Terminal for the attachment; the caller should leave.
    Error,
}

/// Locally cached copy of the shared document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentBuffer {
    pub code: String,
    pub language: Language,
    pub name: String,
    /// Version of the last snapshot or accepted write this buffer reflects.
    pub updated_at: u64,
}

impl DocumentBuffer {
    pub fn from_session(session: &Session) -> Self {
        Self {
            code: session.code.clone(),
            language: session.language,
            name: session.name.clone(),
            updated_at: session.updated_at,
        }
    }

    /// Line count as an editor gutter shows it (an empty document has one line).
    pub fn line_count(&self) -> usize {
        self.code.split('\n').count()
    }

    pub fn char_count(&self) -> usize {
        self.code.chars().count()
    }

    fn matches(&self, session: &Session) -> bool {
        self.updated_at == session.updated_at
            && self.code == session.code
            && self.language == session.language
            && self.name == session.name
    }
}

/// Identity of the user driving this controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub user_id: UserId,
    pub display_name: String,
}

impl LocalUser {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self { user_id, display_name: display_name.into() }
    }
}

/// Events emitted to the embedding UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Live subscription established (or re-established)
    Connected,
    /// Live subscription lost, or the controller detached
    Disconnected,
    /// A remote snapshot replaced the local buffer
    RemoteApplied { updated_at: u64 },
    /// Active roster changed
    RosterChanged(Vec<RosterEntry>),
    /// A document write was accepted by the store
    Saved { updated_at: u64 },
    /// Transient failure; editing continues
    Notice(SyncError),
    /// Fatal failure; the caller should leave the session
    Fatal(SyncError),
}

/// Observable controller state, published on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerView {
    pub state: SyncState,
    pub connected: bool,
    pub buffer: DocumentBuffer,
    /// A debounced write is armed or queued
    pub pending_write: bool,
    /// A write is in flight to the store
    pub saving: bool,
    pub roster: Vec<RosterEntry>,
}

impl ControllerView {
    fn initial() -> Self {
        Self {
            state: SyncState::Disconnected,
            connected: false,
            buffer: DocumentBuffer::default(),
            pending_write: false,
            saving: false,
            roster: Vec::new(),
        }
    }
}

/// Collaborators shared by every controller in a process.
#[derive(Clone)]
pub struct SyncContext {
    pub sessions: Arc<dyn SessionStore>,
    pub presence: Arc<PresenceTracker>,
    pub broadcaster: Arc<ChangeBroadcaster>,
}

impl SyncContext {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        presence: Arc<PresenceTracker>,
        broadcaster: Arc<ChangeBroadcaster>,
    ) -> Self {
        Self { sessions, presence, broadcaster }
    }
}

type Responder = oneshot::Sender<Result<Session, SyncError>>;

enum Command {
    Edit {
        code: String,
        ack: oneshot::Sender<Result<(), SyncError>>,
    },
    SetLanguage {
        language: Language,
        ack: oneshot::Sender<Result<(), SyncError>>,
    },
    Save {
        reply: Responder,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

enum IoDone {
    Write(Result<Session, SyncError>),
    Heartbeat(Result<Participant, SyncError>),
    Roster {
        seq: u64,
        result: Result<Vec<Participant>, SyncError>,
    },
    Subscribed(Result<SessionFeed, SyncError>),
    Resync(Result<Option<Session>, SyncError>),
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Handle to one client's attachment to a session.
///
/// A controller attaches at most once. Drop it, or call
/// [`leave`](Self::leave), to release presence and the subscription.
pub struct SyncController {
    session_id: SessionId,
    user: LocalUser,
    ctx: SyncContext,
    config: SyncConfig,
    view_tx: Option<watch::Sender<ControllerView>>,
    view_rx: watch::Receiver<ControllerView>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    cmd_tx: Option<mpsc::UnboundedSender<Command>>,
    driver: Option<JoinHandle<()>>,
}

impl SyncController {
    pub fn new(ctx: SyncContext, session_id: SessionId, user: LocalUser, config: SyncConfig) -> Self {
        let (view_tx, view_rx) = watch::channel(ControllerView::initial());
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            session_id,
            user,
            ctx,
            config,
            view_tx: Some(view_tx),
            view_rx,
            event_tx,
            event_rx: Some(event_rx),
            cmd_tx: None,
            driver: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Load the session, join presence, subscribe and start the driver.
    ///
    /// Returns `NotFound` (and enters `Error`) if the session does not
    /// exist. Presence and subscription failures are not fatal: they are
    /// reported as notices and retried. Dropping the future part-way
    /// releases any presence it already joined.
    pub async fn attach(&mut self) -> Result<(), SyncError> {
        if self.cmd_tx.is_some() {
            return Err(SyncError::AlreadyAttached);
        }
        let view_tx = self.view_tx.take().ok_or(SyncError::Detached)?;

        let mut driver = Driver::new(
            self.session_id,
            self.user.clone(),
            self.ctx.clone(),
            self.config.clone(),
            view_tx,
            self.event_tx.clone(),
        );
        driver.start().await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.cmd_tx = Some(cmd_tx);
        self.driver = Some(tokio::spawn(driver.run(cmd_rx)));
        Ok(())
    }

    /// Replace the document text. The buffer updates immediately; the store
    /// write happens once edits go quiet for the debounce period.
    pub async fn edit_document(&self, code: impl Into<String>) -> Result<(), SyncError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Edit { code: code.into(), ack })?;
        done.await.map_err(|_| SyncError::Detached)?
    }

    /// Change the language tag. Travels with the next debounced write.
    pub async fn set_language(&self, language: Language) -> Result<(), SyncError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::SetLanguage { language, ack })?;
        done.await.map_err(|_| SyncError::Detached)?
    }

    /// Write the current buffer now, bypassing the debounce timer.
    pub async fn save(&self) -> Result<Session, SyncError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Save { reply })?;
        done.await.map_err(|_| SyncError::Detached)?
    }

    /// Detach: cancel timers, unsubscribe and leave presence.
    ///
    /// Waits for a write already in flight. Unsaved debounced edits are
    /// discarded. Calling it again, or on a never-attached controller, is a
    /// no-op.
    pub async fn leave(&mut self) -> Result<(), SyncError> {
        let Some(cmd_tx) = self.cmd_tx.take() else {
            return Ok(());
        };
        let (reply, done) = oneshot::channel();
        if cmd_tx.send(Command::Leave { reply }).is_ok() {
            let _ = done.await;
        }
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
        Ok(())
    }

    fn send(&self, cmd: Command) -> Result<(), SyncError> {
        self.cmd_tx
            .as_ref()
            .ok_or(SyncError::Detached)?
            .send(cmd)
            .map_err(|_| SyncError::Detached)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn user(&self) -> &LocalUser {
        &self.user
    }

    pub fn state(&self) -> SyncState {
        self.view_rx.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.view_rx.borrow().connected
    }

    pub fn buffer(&self) -> DocumentBuffer {
        self.view_rx.borrow().buffer.clone()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.view_rx.borrow().roster.clone()
    }

    pub fn view(&self) -> ControllerView {
        self.view_rx.borrow().clone()
    }

    /// Receiver that observes every published view.
    pub fn watch(&self) -> watch::Receiver<ControllerView> {
        self.view_rx.clone()
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

struct Driver {
    session_id: SessionId,
    user: LocalUser,
    ctx: SyncContext,
    config: SyncConfig,

    state: SyncState,
    connected: bool,
    fatal: Option<SyncError>,
    buffer: DocumentBuffer,
    roster: Vec<RosterEntry>,

    /// Single-slot debounce timer. Replacing it cancels the previous one.
    debounce: Option<Pin<Box<Sleep>>>,
    heartbeat: Interval,

    feed: Option<SessionFeed>,
    subscribing: bool,
    reconnect: Option<Pin<Box<Sleep>>>,
    backoff: Backoff,

    /// A write is in flight; its completion arrives as `IoDone::Write`.
    in_flight: bool,
    in_flight_waiters: Vec<Responder>,
    /// A flush was requested while a write was in flight.
    queued_flush: bool,
    queued_waiters: Vec<Responder>,
    /// Newest remote snapshot seen while a write was in flight.
    held_remote: Option<Session>,
    /// Last write failed. The buffer holds unsaved work, remote snapshots
    /// are dropped, and the next heartbeat tick retries the write.
    dirty: bool,
    /// Presence was joined and not yet released.
    present: bool,

    roster_seq: u64,
    roster_applied: u64,

    io_tx: mpsc::UnboundedSender<IoDone>,
    io_rx: mpsc::UnboundedReceiver<IoDone>,
    view_tx: watch::Sender<ControllerView>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl Driver {
    fn new(
        session_id: SessionId,
        user: LocalUser,
        ctx: SyncContext,
        config: SyncConfig,
        view_tx: watch::Sender<ControllerView>,
        event_tx: mpsc::Sender<SyncEvent>,
    ) -> Self {
        let period = config.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let backoff = Backoff::new(config.reconnect);

        Self {
            session_id,
            user,
            ctx,
            config,
            state: SyncState::Disconnected,
            connected: false,
            fatal: None,
            buffer: DocumentBuffer::default(),
            roster: Vec::new(),
            debounce: None,
            heartbeat,
            feed: None,
            subscribing: false,
            reconnect: None,
            backoff,
            in_flight: false,
            in_flight_waiters: Vec::new(),
            queued_flush: false,
            queued_waiters: Vec::new(),
            held_remote: None,
            dirty: false,
            present: false,
            roster_seq: 0,
            roster_applied: 0,
            io_tx,
            io_rx,
            view_tx,
            event_tx,
        }
    }

    async fn start(&mut self) -> Result<(), SyncError> {
        self.state = SyncState::Loading;
        self.publish_view();
        log::info!("Attaching {} to session {}", self.user.user_id, self.session_id);

        let snapshot = match self.ctx.sessions.get_session(self.session_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Err(self.fail(SyncError::NotFound(self.session_id))),
            Err(e) => return Err(self.fail(e)),
        };

        self.buffer = DocumentBuffer::from_session(&snapshot);
        self.state = SyncState::Synced;
        self.publish_view();

        // The tracker keeps the join even when the store write fails.
        self.present = true;
        if let Err(e) = self
            .ctx
            .presence
            .join(self.session_id, self.user.user_id, &self.user.display_name)
            .await
        {
            self.emit(SyncEvent::Notice(e));
        }

        match self.ctx.broadcaster.open(self.session_id, EventFilter::ALL).await {
            Ok(feed) => {
                self.feed = Some(feed);
                self.set_connected(true);
            }
            Err(e) => {
                log::warn!("Initial subscribe for session {} failed: {e}", self.session_id);
                self.emit(SyncEvent::Notice(e));
                self.schedule_reconnect();
            }
        }

        self.refresh_roster();
        log::info!(
            "Session {} synced at v{} ({} lines)",
            self.session_id,
            self.buffer.updated_at,
            self.buffer.line_count()
        );
        Ok(())
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Leave { reply }) => {
                        self.detach().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        log::debug!("Controller for session {} dropped, detaching", self.session_id);
                        self.detach().await;
                        return;
                    }
                },

                _ = sleep_opt(&mut self.debounce) => {
                    self.debounce = None;
                    self.flush(None);
                }

                _ = self.heartbeat.tick() => self.on_heartbeat_tick(),

                event = next_event(&mut self.feed) => match event {
                    Some(event) => self.handle_event(event),
                    None => self.on_feed_closed(),
                },

                _ = sleep_opt(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.resubscribe();
                }

                Some(done) = self.io_rx.recv() => self.handle_io(done),
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Edit { code, ack } => {
                let result = self.ensure_synced().map(|()| {
                    self.buffer.code = code;
                    self.arm_debounce();
                });
                let _ = ack.send(result);
            }
            Command::SetLanguage { language, ack } => {
                let result = self.ensure_synced().map(|()| {
                    self.buffer.language = language;
                    self.arm_debounce();
                });
                let _ = ack.send(result);
            }
            Command::Save { reply } => {
                if let Err(e) = self.ensure_synced() {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.debounce = None;
                self.flush(Some(reply));
            }
            Command::Leave { reply } => {
                // Handled in the run loop; nothing left to release here.
                let _ = reply.send(());
            }
        }
    }

    fn ensure_synced(&self) -> Result<(), SyncError> {
        match self.state {
            SyncState::Synced => Ok(()),
            SyncState::Error => Err(self.fatal.clone().unwrap_or(SyncError::Detached)),
            _ => Err(SyncError::Detached),
        }
    }

    fn arm_debounce(&mut self) {
        self.debounce = Some(Box::pin(time::sleep(self.config.debounce)));
        self.publish_view();
    }

    fn write_pending(&self) -> bool {
        self.debounce.is_some() || self.queued_flush || self.dirty
    }

    // ── Writes ───────────────────────────────────────────────────

    fn flush(&mut self, waiter: Option<Responder>) {
        if self.in_flight {
            self.queued_flush = true;
            self.queued_waiters.extend(waiter);
            self.publish_view();
            return;
        }
        self.start_write(waiter.into_iter().collect());
    }

    fn start_write(&mut self, waiters: Vec<Responder>) {
        let patch = SessionPatch {
            code: Some(self.buffer.code.clone()),
            language: Some(self.buffer.language),
            name: None,
        };
        self.in_flight = true;
        self.in_flight_waiters = waiters;
        self.dirty = false;
        log::debug!(
            "Writing session {} ({} chars)",
            self.session_id,
            self.buffer.char_count()
        );

        let sessions = self.ctx.sessions.clone();
        let io_tx = self.io_tx.clone();
        let session_id = self.session_id;
        tokio::spawn(async move {
            let result = sessions.update_session(session_id, patch).await;
            let _ = io_tx.send(IoDone::Write(result));
        });
        self.publish_view();
    }

    fn on_write_done(&mut self, result: Result<Session, SyncError>) {
        self.in_flight = false;
        match &result {
            Ok(accepted) => {
                if accepted.updated_at > self.buffer.updated_at {
                    self.buffer.updated_at = accepted.updated_at;
                }
                log::debug!("Session {} write accepted at v{}", self.session_id, accepted.updated_at);
                self.emit(SyncEvent::Saved { updated_at: accepted.updated_at });
            }
            Err(e) => {
                log::warn!("Write to session {} failed: {e}", self.session_id);
                self.dirty = true;
                self.emit(SyncEvent::Notice(e.clone()));
            }
        }
        for waiter in self.in_flight_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }

        if self.queued_flush {
            self.queued_flush = false;
            let waiters = std::mem::take(&mut self.queued_waiters);
            self.start_write(waiters);
            return;
        }

        if let Some(held) = self.held_remote.take() {
            if !self.write_pending() && held.updated_at > self.buffer.updated_at {
                self.apply_remote(held);
            }
        }
        self.publish_view();
    }

    // ── Remote changes ───────────────────────────────────────────

    fn handle_event(&mut self, event: ChangeEvent) {
        if self.state != SyncState::Synced {
            return;
        }
        match event {
            ChangeEvent::SessionChanged { snapshot, .. } => self.on_remote_snapshot(snapshot),
            ChangeEvent::PresenceChanged { .. } => self.refresh_roster(),
        }
    }

    fn on_remote_snapshot(&mut self, snapshot: Session) {
        if self.write_pending() {
            log::debug!(
                "Local edit pending in session {}, dropping remote v{}",
                self.session_id,
                snapshot.updated_at
            );
            return;
        }
        if self.in_flight {
            let newer = self
                .held_remote
                .as_ref()
                .map_or(true, |held| snapshot.updated_at > held.updated_at);
            if newer {
                self.held_remote = Some(snapshot);
            }
            return;
        }
        self.apply_remote(snapshot);
    }

    /// Replace the buffer with a remote snapshot. Idempotent.
    fn apply_remote(&mut self, snapshot: Session) {
        if snapshot.updated_at < self.buffer.updated_at {
            log::trace!(
                "Ignoring stale v{} for session {} (local v{})",
                snapshot.updated_at,
                self.session_id,
                self.buffer.updated_at
            );
            return;
        }
        if self.buffer.matches(&snapshot) {
            return;
        }
        self.buffer = DocumentBuffer::from_session(&snapshot);
        self.dirty = false;
        log::debug!("Applied remote v{} to session {}", snapshot.updated_at, self.session_id);
        self.emit(SyncEvent::RemoteApplied { updated_at: snapshot.updated_at });
        self.publish_view();
    }

    // ── Presence ─────────────────────────────────────────────────

    fn on_heartbeat_tick(&mut self) {
        if self.state != SyncState::Synced {
            return;
        }
        let presence = self.ctx.presence.clone();
        let io_tx = self.io_tx.clone();
        let session_id = self.session_id;
        let user_id = self.user.user_id;
        tokio::spawn(async move {
            let result = presence.heartbeat(session_id, user_id).await;
            let _ = io_tx.send(IoDone::Heartbeat(result));
        });

        if self.dirty && !self.in_flight && self.debounce.is_none() && !self.queued_flush {
            log::debug!("Retrying failed write for session {}", self.session_id);
            self.flush(None);
        }
    }

    fn refresh_roster(&mut self) {
        self.roster_seq += 1;
        let seq = self.roster_seq;
        let presence = self.ctx.presence.clone();
        let io_tx = self.io_tx.clone();
        let session_id = self.session_id;
        let window = self.config.presence_window;
        tokio::spawn(async move {
            let result = presence.list_active_now(session_id, window).await;
            let _ = io_tx.send(IoDone::Roster { seq, result });
        });
    }

    fn on_roster(&mut self, seq: u64, result: Result<Vec<Participant>, SyncError>) {
        if seq < self.roster_applied {
            return;
        }
        match result {
            Ok(participants) => {
                self.roster_applied = seq;
                let roster = build_roster(participants, self.user.user_id);
                if roster != self.roster {
                    self.roster = roster.clone();
                    self.emit(SyncEvent::RosterChanged(roster));
                    self.publish_view();
                }
            }
            Err(e) => {
                log::warn!("Roster query for session {} failed: {e}", self.session_id);
                self.emit(SyncEvent::Notice(e));
            }
        }
    }

    // ── Subscription ─────────────────────────────────────────────

    fn on_feed_closed(&mut self) {
        log::warn!("Subscription for session {} dropped", self.session_id);
        self.feed = None;
        self.set_connected(false);
        self.emit(SyncEvent::Notice(SyncError::Channel("subscription dropped".into())));
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        log::info!(
            "Resubscribing to session {} in {:?} (attempt {})",
            self.session_id,
            delay,
            self.backoff.attempts()
        );
        self.reconnect = Some(Box::pin(time::sleep(delay)));
    }

    fn resubscribe(&mut self) {
        if self.feed.is_some() || self.subscribing {
            return;
        }
        self.subscribing = true;
        let broadcaster = self.ctx.broadcaster.clone();
        let io_tx = self.io_tx.clone();
        let session_id = self.session_id;
        tokio::spawn(async move {
            let result = broadcaster.open(session_id, EventFilter::ALL).await;
            let _ = io_tx.send(IoDone::Subscribed(result));
        });
    }

    fn on_subscribed(&mut self, result: Result<SessionFeed, SyncError>) {
        self.subscribing = false;
        match result {
            Ok(feed) => {
                if self.feed.is_some() {
                    return;
                }
                self.feed = Some(feed);
                self.backoff.reset();
                self.set_connected(true);

                // Events missed while disconnected are not replayed.
                let sessions = self.ctx.sessions.clone();
                let io_tx = self.io_tx.clone();
                let session_id = self.session_id;
                tokio::spawn(async move {
                    let result = sessions.get_session(session_id).await;
                    let _ = io_tx.send(IoDone::Resync(result));
                });
                self.refresh_roster();
            }
            Err(e) => {
                log::warn!("Resubscribe to session {} failed: {e}", self.session_id);
                self.emit(SyncEvent::Notice(e));
                self.schedule_reconnect();
            }
        }
    }

    fn on_resync(&mut self, result: Result<Option<Session>, SyncError>) {
        match result {
            Ok(Some(snapshot)) => {
                if self.state == SyncState::Synced {
                    self.on_remote_snapshot(snapshot);
                }
            }
            Ok(None) => {
                self.fail(SyncError::NotFound(self.session_id));
            }
            Err(e) => self.emit(SyncEvent::Notice(e)),
        }
    }

    fn handle_io(&mut self, done: IoDone) {
        match done {
            IoDone::Write(result) => self.on_write_done(result),
            IoDone::Heartbeat(result) => match result {
                Ok(_) => self.refresh_roster(),
                Err(e) => self.emit(SyncEvent::Notice(e)),
            },
            IoDone::Roster { seq, result } => self.on_roster(seq, result),
            IoDone::Subscribed(result) => self.on_subscribed(result),
            IoDone::Resync(result) => self.on_resync(result),
        }
    }

    // ── Detach ───────────────────────────────────────────────────

    async fn detach(&mut self) {
        if self.debounce.take().is_some() {
            log::info!("Discarding unsaved edit in session {} on detach", self.session_id);
        }
        self.reconnect = None;
        self.queued_flush = false;
        for waiter in self.queued_waiters.drain(..) {
            let _ = waiter.send(Err(SyncError::Detached));
        }

        // A write already in flight is left to complete.
        while self.in_flight {
            match self.io_rx.recv().await {
                Some(IoDone::Write(result)) => {
                    self.in_flight = false;
                    for waiter in self.in_flight_waiters.drain(..) {
                        let _ = waiter.send(result.clone());
                    }
                    if let Ok(accepted) = result {
                        self.emit(SyncEvent::Saved { updated_at: accepted.updated_at });
                    }
                }
                Some(_) => {}
                None => break,
            }
        }

        if let Some(feed) = self.feed.take() {
            if let Err(e) = feed.close().await {
                log::warn!("Unsubscribe from session {} failed: {e}", self.session_id);
            }
        }

        if self.present {
            self.present = false;
            if let Err(e) = self.ctx.presence.leave(self.session_id, self.user.user_id).await {
                log::warn!("Presence leave for session {} failed: {e}", self.session_id);
            }
        }

        if self.state != SyncState::Error {
            self.state = SyncState::Disconnected;
        }
        self.set_connected(false);
        self.publish_view();
        log::info!("{} detached from session {}", self.user.user_id, self.session_id);
    }

    // ── Plumbing ─────────────────────────────────────────────────

    fn fail(&mut self, error: SyncError) -> SyncError {
        log::warn!("Session {} failed: {error}", self.session_id);
        self.state = SyncState::Error;
        self.fatal = Some(error.clone());
        self.debounce = None;
        self.emit(SyncEvent::Fatal(error.clone()));
        self.publish_view();
        error
    }

    fn set_connected(&mut self, connected: bool) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;
        self.emit(if connected { SyncEvent::Connected } else { SyncEvent::Disconnected });
        self.publish_view();
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::trace!("Controller event not delivered: {e}");
        }
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(ControllerView {
            state: self.state,
            connected: self.connected,
            buffer: self.buffer.clone(),
            pending_write: self.write_pending(),
            saving: self.in_flight,
            roster: self.roster.clone(),
        });
    }
}

impl Drop for Driver {
    /// Releases presence when the driver goes away without detaching, such
    /// as an `attach` future dropped after the join.
    fn drop(&mut self) {
        if !self.present {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let presence = self.ctx.presence.clone();
            let session_id = self.session_id;
            let user_id = self.user.user_id;
            handle.spawn(async move {
                if let Err(e) = presence.leave(session_id, user_id).await {
                    log::warn!("Presence leave for abandoned driver in session {session_id} failed: {e}");
                }
            });
        }
    }
}

async fn sleep_opt(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_event(feed: &mut Option<SessionFeed>) -> Option<ChangeEvent> {
    match feed {
        Some(feed) => feed.next().await,
        None => std::future::pending().await,
    }
}
