//! codecollab-relay — standalone WebSocket notification relay.
//!
//! Bind address defaults to `127.0.0.1:9090`; override it with
//! `CODECOLLAB_RELAY_ADDR`. Log verbosity follows `RUST_LOG`.

use log::{error, info};

use codecollab_sync::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = RelayConfig::from_env();
    info!(
        "Starting relay on {} (room capacity {}, max {} subscribers per session)",
        config.bind_addr, config.room_capacity, config.max_subscribers_per_room
    );

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down after {} connections, {} events forwarded",
                stats.total_connections, stats.events_forwarded
            );
        }
    }
}
