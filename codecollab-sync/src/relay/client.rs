//! Relay client: [`NotificationChannel`] and [`EventSink`] over WebSocket.
//!
//! Each subscription owns its own connection, so one dropped socket ends
//! exactly one stream. Publishing shares a single lazily opened connection
//! and waits for the relay's acknowledgement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::channel::{
    ChangeEvent, EventFilter, EventSink, NotificationChannel, Subscription, SubscriptionId,
};
use crate::error::SyncError;
use crate::model::SessionId;
use crate::relay::frame::{FrameError, RelayFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on waiting for `Subscribed` or `Published`.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for a [`RelayServer`](crate::relay::RelayServer).
pub struct RelayChannel {
    url: String,
    publisher: Mutex<Option<WsStream>>,
    subscriptions: RwLock<HashMap<SubscriptionId, oneshot::Sender<()>>>,
    next_id: AtomicU64,
}

impl RelayChannel {
    /// `url` is the relay's WebSocket address, e.g. `ws://127.0.0.1:9090`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            publisher: Mutex::new(None),
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of subscriptions this client currently holds open.
    pub async fn active_subscriptions(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    async fn connect(&self) -> Result<WsStream, FrameError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        log::debug!("Connected to relay {}", self.url);
        Ok(ws)
    }

    async fn open_subscription(
        &self,
        session_id: SessionId,
        filter: EventFilter,
    ) -> Result<WsStream, FrameError> {
        let mut ws = self.connect().await?;
        send_frame(&mut ws, &RelayFrame::Subscribe { session_id, filter }).await?;
        match recv_reply(&mut ws).await? {
            RelayFrame::Subscribed => Ok(ws),
            RelayFrame::Rejected { reason } => Err(FrameError::Rejected(reason)),
            other => Err(FrameError::Unexpected(format!("{other:?}"))),
        }
    }

    async fn publish_frame(&self, event: ChangeEvent) -> Result<u64, FrameError> {
        let mut publisher = self.publisher.lock().await;
        if publisher.is_none() {
            *publisher = Some(self.connect().await?);
        }
        let Some(ws) = publisher.as_mut() else {
            return Err(FrameError::ConnectionClosed);
        };

        let result = async {
            send_frame(ws, &RelayFrame::Publish(event)).await?;
            match recv_reply(ws).await? {
                RelayFrame::Published { delivered } => Ok(delivered),
                RelayFrame::Rejected { reason } => Err(FrameError::Rejected(reason)),
                other => Err(FrameError::Unexpected(format!("{other:?}"))),
            }
        }
        .await;

        if result.is_err() {
            // Reconnect on the next publish.
            *publisher = None;
        }
        result
    }
}

#[async_trait]
impl NotificationChannel for RelayChannel {
    async fn subscribe(
        &self,
        session_id: SessionId,
        filter: EventFilter,
    ) -> Result<Subscription, SyncError> {
        let ws = self.open_subscription(session_id, filter).await.inspect_err(|e| {
            log::warn!("Subscribe to session {session_id} via {} failed: {e}", self.url)
        })?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.subscriptions.write().await.insert(id, cancel_tx);
        log::info!("Relay subscription {id} open for session {session_id}");

        let events = futures_util::stream::unfold(
            (ws, cancel_rx),
            move |(mut ws, mut cancel)| async move {
                loop {
                    tokio::select! {
                        _ = &mut cancel => {
                            let _ = ws.close(None).await;
                            return None;
                        }
                        msg = ws.next() => match msg {
                            Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                                Ok(RelayFrame::Event(event)) => return Some((event, (ws, cancel))),
                                Ok(other) => log::debug!("{id} ignoring frame {other:?}"),
                                Err(e) => log::warn!("{id} received undecodable frame: {e}"),
                            },
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Relay closed subscription {id}");
                                return None;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                log::warn!("Relay subscription {id} failed: {e}");
                                return None;
                            }
                        }
                    }
                }
            },
        );

        Ok(Subscription { id, events: Box::pin(events) })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SyncError> {
        if let Some(cancel) = self.subscriptions.write().await.remove(&id) {
            let _ = cancel.send(());
            log::debug!("Released relay subscription {id}");
        }
        Ok(())
    }
}

#[async_trait]
impl EventSink for RelayChannel {
    async fn publish(&self, event: ChangeEvent) -> Result<usize, SyncError> {
        let delivered = self.publish_frame(event).await?;
        Ok(delivered as usize)
    }
}

async fn send_frame(ws: &mut WsStream, frame: &RelayFrame) -> Result<(), FrameError> {
    let encoded = frame.encode()?;
    ws.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

/// Wait for the next protocol frame, skipping control messages.
async fn recv_reply(ws: &mut WsStream) -> Result<RelayFrame, FrameError> {
    let next = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return RelayFrame::decode(&data),
                Some(Ok(Message::Close(_))) | None => return Err(FrameError::ConnectionClosed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    };
    tokio::time::timeout(REPLY_TIMEOUT, next)
        .await
        .map_err(|_| FrameError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_subscribe_unreachable_relay() {
        // Port 1 on loopback is never a relay.
        let channel = RelayChannel::new("ws://127.0.0.1:1");
        let err = channel.subscribe(Uuid::new_v4(), EventFilter::ALL).await.unwrap_err();
        assert!(matches!(err, SyncError::Channel(_)));
        assert_eq!(channel.active_subscriptions().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_ok() {
        let channel = RelayChannel::new("ws://127.0.0.1:1");
        assert!(channel.unsubscribe(SubscriptionId(7)).await.is_ok());
    }
}
