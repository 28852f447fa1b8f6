//! Integration tests for the WebSocket relay.
//!
//! These tests start a real relay on a free port and connect clients over
//! loopback, including two full sync controllers.

use codecollab_sync::channel::{ChangeEvent, EventFilter, EventSink, NotificationChannel};
use codecollab_sync::controller::{LocalUser, SyncContext, SyncController, SyncEvent};
use codecollab_sync::relay::{RelayChannel, RelayConfig, RelayServer};
use codecollab_sync::{
    ChangeBroadcaster, MemoryPresenceStore, MemorySessionStore, PresenceTracker, Session,
    SyncConfig, SyncError,
};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Start a relay on a free port, return its URL and handle.
async fn start_relay(max_subscribers_per_room: usize) -> (String, Arc<RelayServer>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(RelayServer::new(RelayConfig {
        bind_addr: addr.to_string(),
        room_capacity: 64,
        max_subscribers_per_room,
    }));

    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (format!("ws://{addr}"), server)
}

async fn wait_for_subscribers(server: &RelayServer, session_id: Uuid, expected: usize) {
    for _ in 0..200 {
        if server.hub().subscriber_count(&session_id).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("relay never reached {expected} subscribers");
}

// ─── Channel ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_publish_reaches_subscriber() {
    let (url, server) = start_relay(10).await;
    let session_id = Uuid::new_v4();

    let subscriber = RelayChannel::new(&url);
    let mut sub = subscriber.subscribe(session_id, EventFilter::ALL).await.unwrap();

    let publisher = RelayChannel::new(&url);
    let session = Session::new(session_id, "Relay").with_code("let x = 1;");
    let delivered = publisher
        .publish(ChangeEvent::session_changed(session.clone()))
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let event = timeout(Duration::from_secs(2), sub.events.next()).await.unwrap();
    assert_eq!(event, Some(ChangeEvent::session_changed(session)));

    let stats = server.stats().await;
    assert_eq!(stats.events_forwarded, 1);
    assert_eq!(stats.active_connections, 2);
}

#[tokio::test]
async fn test_filter_and_session_scoping() {
    let (url, _server) = start_relay(10).await;
    let session_id = Uuid::new_v4();

    let subscriber = RelayChannel::new(&url);
    let mut sub = subscriber.subscribe(session_id, EventFilter::PRESENCE_ONLY).await.unwrap();

    let publisher = RelayChannel::new(&url);
    publisher
        .publish(ChangeEvent::session_changed(Session::new(session_id, "Filtered")))
        .await
        .unwrap();
    publisher.publish(ChangeEvent::presence_changed(Uuid::new_v4())).await.unwrap();
    publisher.publish(ChangeEvent::presence_changed(session_id)).await.unwrap();

    let event = timeout(Duration::from_secs(2), sub.events.next()).await.unwrap();
    assert_eq!(event, Some(ChangeEvent::presence_changed(session_id)));
}

#[tokio::test]
async fn test_room_capacity_enforced() {
    let (url, _server) = start_relay(1).await;
    let session_id = Uuid::new_v4();

    let first = RelayChannel::new(&url);
    let _held = first.subscribe(session_id, EventFilter::ALL).await.unwrap();

    let second = RelayChannel::new(&url);
    let err = second.subscribe(session_id, EventFilter::ALL).await.unwrap_err();
    assert!(matches!(err, SyncError::Channel(ref msg) if msg.contains("room full")));

    // Other sessions are unaffected.
    assert!(second.subscribe(Uuid::new_v4(), EventFilter::ALL).await.is_ok());
}

#[tokio::test]
async fn test_unsubscribe_releases_relay_slot() {
    let (url, server) = start_relay(10).await;
    let session_id = Uuid::new_v4();

    let channel = RelayChannel::new(&url);
    let mut sub = channel.subscribe(session_id, EventFilter::ALL).await.unwrap();
    wait_for_subscribers(&server, session_id, 1).await;

    channel.unsubscribe(sub.id).await.unwrap();
    channel.unsubscribe(sub.id).await.unwrap();
    assert_eq!(channel.active_subscriptions().await, 0);

    let ended = timeout(Duration::from_secs(2), sub.events.next()).await.unwrap();
    assert!(ended.is_none());
    wait_for_subscribers(&server, session_id, 0).await;
}

// ─── Controllers over the relay ──────────────────────────────────

#[tokio::test]
async fn test_controllers_sync_through_relay() {
    let (url, _server) = start_relay(10).await;

    let relay = Arc::new(RelayChannel::new(&url));
    let sessions = Arc::new(MemorySessionStore::new().with_sink(relay.clone()));
    let presence = Arc::new(MemoryPresenceStore::new().with_sink(relay.clone()));
    let session = Session::new(Uuid::new_v4(), "Remote pairing").with_code("// start");
    let session_id = session.id;
    sessions.insert(session).await;

    let ctx = SyncContext::new(
        sessions.clone(),
        Arc::new(PresenceTracker::with_system_clock(presence)),
        Arc::new(ChangeBroadcaster::new(relay.clone())),
    );
    let config = SyncConfig { debounce: Duration::from_millis(50), ..SyncConfig::default() };

    let mut alice = SyncController::new(
        ctx.clone(),
        session_id,
        LocalUser::new(Uuid::new_v4(), "Alice"),
        config.clone(),
    );
    let mut bob = SyncController::new(ctx, session_id, LocalUser::new(Uuid::new_v4(), "Bob"), config);
    let mut bob_events = bob.take_event_rx().unwrap();
    alice.attach().await.unwrap();
    bob.attach().await.unwrap();

    alice.edit_document("fn shared() {}").await.unwrap();

    let applied = timeout(Duration::from_secs(5), async {
        loop {
            match bob_events.recv().await {
                Some(SyncEvent::RemoteApplied { updated_at }) => return updated_at,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(applied, 1);
    assert_eq!(bob.buffer().code, "fn shared() {}");

    let mut roster = bob.watch();
    timeout(Duration::from_secs(5), roster.wait_for(|v| v.roster.len() == 2))
        .await
        .unwrap()
        .unwrap();

    alice.leave().await.unwrap();
    bob.leave().await.unwrap();
}
