//! WebSocket relay: a network-reachable notification channel.
//!
//! ```text
//! store (publisher) ── Publish ──┐
//!                                ├── LocalHub room (session_id) ──┬── Event ──► controller A
//! store (publisher) ── Publish ──┘                                └── Event ──► controller B
//! ```
//!
//! A connection is either a publisher (any number of `Publish` frames) or
//! a subscriber (one `Subscribe`, then a stream of `Event`s). A subscriber
//! that lags beyond the room capacity is disconnected; the client sees its
//! stream end and resubscribes.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::channel::{EventStream, NotificationChannel, SubscriptionId};
use crate::hub::LocalHub;
use crate::relay::frame::{FrameError, RelayFrame};

/// Environment variable overriding [`RelayConfig::bind_addr`].
pub const RELAY_ADDR_ENV: &str = "CODECOLLAB_RELAY_ADDR";

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Per-subscriber event buffer
    pub room_capacity: usize,
    /// Maximum subscribers per session
    pub max_subscribers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            room_capacity: 256,
            max_subscribers_per_room: 100,
        }
    }
}

impl RelayConfig {
    /// Defaults, with the bind address taken from `CODECOLLAB_RELAY_ADDR`
    /// when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var(RELAY_ADDR_ENV) {
            if !addr.trim().is_empty() {
                config.bind_addr = addr.trim().to_string();
            }
        }
        config
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub events_forwarded: u64,
    pub rejected_subscriptions: u64,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    hub: Arc<LocalHub>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let hub = Arc::new(LocalHub::new(config.room_capacity));
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<LocalHub>,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> Result<(), FrameError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut subscription: Option<(SubscriptionId, EventStream)> = None;

        let result: Result<(), FrameError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let frame = match RelayFrame::decode(&data) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            let reply = match frame {
                                RelayFrame::Subscribe { session_id, filter } => {
                                    if subscription.is_some() {
                                        Some(RelayFrame::Rejected { reason: "already subscribed".into() })
                                    } else if hub.subscriber_count(&session_id).await
                                        >= config.max_subscribers_per_room
                                    {
                                        stats.write().await.rejected_subscriptions += 1;
                                        log::warn!("Session {session_id} is full, rejecting {addr}");
                                        Some(RelayFrame::Rejected { reason: "room full".into() })
                                    } else {
                                        match hub.subscribe(session_id, filter).await {
                                            Ok(sub) => {
                                                log::info!("{addr} subscribed to session {session_id} as {}", sub.id);
                                                subscription = Some((sub.id, sub.events));
                                                Some(RelayFrame::Subscribed)
                                            }
                                            Err(e) => Some(RelayFrame::Rejected { reason: e.to_string() }),
                                        }
                                    }
                                }
                                RelayFrame::Publish(event) => {
                                    let delivered = hub.send(event).await;
                                    Some(RelayFrame::Published { delivered: delivered as u64 })
                                }
                                other => {
                                    log::debug!("Ignoring client frame from {addr}: {other:?}");
                                    None
                                }
                            };

                            if let Some(reply) = reply {
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => return Err(e.into()),

                        Some(Ok(_)) => {}
                    },

                    event = async {
                        match subscription.as_mut() {
                            Some((_, events)) => events.next().await,
                            None => std::future::pending().await,
                        }
                    } => match event {
                        Some(event) => {
                            let encoded = RelayFrame::Event(event).encode()?;
                            stats.write().await.events_forwarded += 1;
                            ws_sender.send(Message::Binary(encoded.into())).await?;
                        }
                        None => {
                            log::warn!("Subscriber {addr} fell behind, closing");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    },
                }
            }
        }
        .await;

        if let Some((id, _)) = subscription.take() {
            if let Err(e) = hub.unsubscribe(id).await {
                log::warn!("Failed to release {id} for {addr}: {e}");
            }
        }
        stats.write().await.active_connections -= 1;

        result
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Hub routing events between connections.
    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.room_capacity, 256);
        assert_eq!(config.max_subscribers_per_room, 100);
    }

    #[test]
    fn test_relay_custom_config() {
        let server = RelayServer::new(RelayConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            room_capacity: 16,
            max_subscribers_per_room: 2,
        });
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
        assert_eq!(server.hub().capacity(), 16);
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.stats().await, RelayStats::default());
    }
}
