//! Realtime backbone of the virtual classroom: presence and host election, per-room
//! notification fan-out, page replay, live-state channels and attendance scheduling.

pub mod accounting;
pub mod config;
pub mod error;
pub mod events;
pub mod keys;
pub mod live_state;
pub mod metrics;
pub mod notify;
pub mod presence;
pub mod replay;
pub mod room;
pub mod routes;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod store_redis;
pub mod telemetry;
