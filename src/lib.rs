//! Core coordination subsystems for a Soulseek-style peer-to-peer file
//! sharing daemon: connection watchdog, distributed search, upload
//! governing/queuing, transfer tracking and persistence, and schema
//! migration.
//!
//! HTTP controllers, authentication, the push-hub transport, and the wire
//! protocol client are out of scope; this crate exposes the pieces those
//! layers depend on (`Daemon`, the individual services, `HubEvent`).

pub mod bucket;
pub mod config;
pub mod daemon;
pub mod error;
pub mod governor;
pub mod hub;
pub mod migrate;
pub mod peer;
pub mod queue;
pub mod search;
pub mod transfers;
pub mod vpn;
pub mod watchdog;

pub use daemon::Daemon;
pub use error::{DaemonError, Result};
