//! Crate-level error aggregation.
//!
//! Each subsystem defines its own `thiserror` enum (see `transfers::TransferError`,
//! `search::SearchError`, `queue::QueueError`, `watchdog::WatchdogError`,
//! `migrate::MigrationError`, `vpn::VpnError`). `DaemonError` folds them together
//! for callers that sit above a single subsystem, such as the application wiring
//! in `daemon.rs`.

use thiserror::Error;

use crate::migrate::MigrationError;
use crate::queue::QueueError;
use crate::search::SearchError;
use crate::transfers::TransferError;
use crate::vpn::VpnError;
use crate::watchdog::WatchdogError;

pub type Result<T> = std::result::Result<T, DaemonError>;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Watchdog(#[from] WatchdogError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Vpn(#[from] VpnError),

    #[error("configuration error: {0}")]
    Config(String),
}
