//! Error taxonomy shared by stores, channels and the controller.

use crate::model::SessionId;

/// Errors surfaced by the sync engine.
///
/// `NotFound` is fatal to an attachment. `StoreWrite` and `Channel` are
/// transient: the controller reports them and keeps editing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Session id did not resolve at attach time
    NotFound(SessionId),
    /// Document write or presence upsert failed
    StoreWrite(String),
    /// Store read failed
    StoreRead(String),
    /// Subscription dropped or could not be established
    Channel(String),
    /// Wire encoding failed
    Serialization(String),
    /// Heartbeat for a participant this tracker never joined
    NotJoined,
    /// Controller is already attached to a session
    AlreadyAttached,
    /// Controller has been detached
    Detached,
}

impl SyncError {
    /// Whether editing can continue after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::StoreWrite(_) | SyncError::StoreRead(_) | SyncError::Channel(_)
        )
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::NotFound(id) => write!(f, "Session not found: {id}"),
            SyncError::StoreWrite(e) => write!(f, "Store write failed: {e}"),
            SyncError::StoreRead(e) => write!(f, "Store read failed: {e}"),
            SyncError::Channel(e) => write!(f, "Notification channel error: {e}"),
            SyncError::Serialization(e) => write!(f, "Serialization error: {e}"),
            SyncError::NotJoined => write!(f, "Participant has not joined this session"),
            SyncError::AlreadyAttached => write!(f, "Controller is already attached"),
            SyncError::Detached => write!(f, "Controller is detached"),
        }
    }
}

impl std::error::Error for SyncError {}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::StoreWrite("disk full".into()).is_transient());
        assert!(SyncError::Channel("reset".into()).is_transient());
        assert!(!SyncError::NotFound(Uuid::nil()).is_transient());
        assert!(!SyncError::Detached.is_transient());
    }

    #[test]
    fn test_display() {
        let id = Uuid::nil();
        assert_eq!(
            SyncError::NotFound(id).to_string(),
            format!("Session not found: {id}")
        );
        assert_eq!(
            SyncError::StoreWrite("timeout".into()).to_string(),
            "Store write failed: timeout"
        );
    }
}
