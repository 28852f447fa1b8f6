//! Relay wire frames.
//!
//! Every WebSocket binary message carries exactly one bincode-encoded
//! [`RelayFrame`]:
//!
//! ```text
//! client                              relay
//!   │ ── Subscribe { session, filter } ──► │
//!   │ ◄──────────── Subscribed ─────────── │   or Rejected { reason }
//!   │ ◄──────────── Event(e) ───────────── │   (repeated)
//!
//!   │ ── Publish(e) ─────────────────────► │
//!   │ ◄──────── Published { delivered } ── │
//! ```

use serde::{Deserialize, Serialize};

use crate::channel::{ChangeEvent, EventFilter};
use crate::error::SyncError;
use crate::model::SessionId;

/// One relay protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Turn this connection into a subscription for one session
    Subscribe {
        session_id: SessionId,
        filter: EventFilter,
    },
    /// Subscription is live; events from now on are forwarded
    Subscribed,
    /// Subscription refused (room full, already subscribed)
    Rejected { reason: String },
    /// Fan an event out to the session's subscribers
    Publish(ChangeEvent),
    /// Publish acknowledgement
    Published { delivered: u64 },
    /// Forwarded event
    Event(ChangeEvent),
}

impl RelayFrame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| FrameError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| FrameError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Relay transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Serialization(String),
    Deserialization(String),
    /// A well-formed frame arrived where another was expected
    Unexpected(String),
    Rejected(String),
    ConnectionClosed,
    Timeout,
    WebSocket(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::Unexpected(frame) => write!(f, "Unexpected frame: {frame}"),
            Self::Rejected(reason) => write!(f, "Relay rejected request: {reason}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Relay timeout"),
            Self::WebSocket(e) => write!(f, "WebSocket error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<tokio_tungstenite::tungstenite::Error> for FrameError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        FrameError::WebSocket(e.to_string())
    }
}

impl From<FrameError> for SyncError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Serialization(msg) | FrameError::Deserialization(msg) => {
                SyncError::Serialization(msg)
            }
            other => SyncError::Channel(other.to_string()),
        }
    }
}
