//! WebSocket notification relay.
//!
//! - [`frame`] — bincode-encoded wire frames
//! - [`server`] — relay server fanning events out per session
//! - [`client`] — [`RelayChannel`], the controller-side transport

pub mod client;
pub mod frame;
pub mod server;

pub use client::RelayChannel;
pub use frame::{FrameError, RelayFrame};
pub use server::{RelayConfig, RelayServer, RelayStats, RELAY_ADDR_ENV};
