//! Session and participant records plus the time source used by presence.
//!
//! These are transient, locally-cached copies of records owned by the
//! external stores. Identifiers are UUIDs assigned outside the core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub type SessionId = Uuid;
pub type UserId = Uuid;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

// ───────────────────────────────────────────────────────────────────
// Language
// ───────────────────────────────────────────────────────────────────

/// Language tag from the fixed editor vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    JavaScript,
    TypeScript,
    Python,
    Java,
    Cpp,
    Html,
    Css,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::JavaScript,
        Language::TypeScript,
        Language::Python,
        Language::Java,
        Language::Cpp,
        Language::Html,
        Language::Css,
    ];

    /// Wire tag, as stored in the session record.
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::Html => "html",
            Language::Css => "css",
        }
    }

    /// Human-readable name for language pickers.
    pub fn label(&self) -> &'static str {
        match self {
            Language::JavaScript => "JavaScript",
            Language::TypeScript => "TypeScript",
            Language::Python => "Python",
            Language::Java => "Java",
            Language::Cpp => "C++",
            Language::Html => "HTML",
            Language::Css => "CSS",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a language tag is outside the vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLanguage(pub String);

impl fmt::Display for UnknownLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown language tag: {}", self.0)
    }
}

impl std::error::Error for UnknownLanguage {}

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .iter()
            .copied()
            .find(|lang| lang.as_str() == s)
            .ok_or_else(|| UnknownLanguage(s.to_string()))
    }
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

/// The shared document plus its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub code: String,
    pub language: Language,
    pub name: String,
    /// Version counter; strictly increases on every accepted write.
    pub updated_at: u64,
}

impl Session {
    pub fn new(id: SessionId, name: impl Into<String>) -> Self {
        Self {
            id,
            code: String::new(),
            language: Language::default(),
            name: name.into(),
            updated_at: 0,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    /// Apply a partial update in place. Does not touch `updated_at`.
    pub fn apply(&mut self, patch: &SessionPatch) {
        if let Some(code) = &patch.code {
            self.code.clone_from(code);
        }
        if let Some(language) = patch.language {
            self.language = language;
        }
        if let Some(name) = &patch.name {
            self.name.clone_from(name);
        }
    }
}

/// Partial update for `SessionStore::update_session`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub code: Option<String>,
    pub language: Option<Language>,
    pub name: Option<String>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.code.is_none() && self.language.is_none() && self.name.is_none()
    }
}

// ───────────────────────────────────────────────────────────────────
// Participant
// ───────────────────────────────────────────────────────────────────

/// One user's presence record within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub display_name: String,
    /// Hex color, derived from `user_id` alone.
    pub color: String,
    pub last_seen: Timestamp,
}

impl Participant {
    /// Whether this participant counts as present at `now` for the given window.
    pub fn is_active(&self, now: Timestamp, window: Duration) -> bool {
        self.last_seen >= window_start(now, window)
    }
}

/// First timestamp still inside a trailing window ending at `now`.
pub fn window_start(now: Timestamp, window: Duration) -> Timestamp {
    let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    now.saturating_sub(window_ms)
}

// ───────────────────────────────────────────────────────────────────
// Clock
// ───────────────────────────────────────────────────────────────────

/// Wall-clock source for presence timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Reads `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to. Used in tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self { now: AtomicU64::new(start) }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
