//! VPN Readiness: polls a VPN helper, exports
//! `is_ready`, and applies a forwarded-port overlay to the running
//! configuration.
//!
//! A `tokio::time::sleep` loop guarded by a `CancellationToken`, with a
//! `Mutex` serializing the actual network call so overlapping ticks (a slow
//! helper response outliving its own poll period) never run two fetches
//! concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::OptionsMonitor;
use crate::peer::PeerClient;

#[derive(Debug, Error)]
pub enum VpnError {
    #[error("vpn helper request failed: {0}")]
    HelperUnavailable(String),
}

/// Status returned by the VPN helper sidecar.
#[derive(Debug, Clone, Default)]
pub struct VpnStatus {
    pub is_connected: bool,
    pub public_ip: Option<String>,
    pub location: Option<String>,
    pub forwarded_port: Option<u16>,
}

/// The VPN sidecar this daemon depends on but does not implement. May be
/// realised over HTTP; that transport is out of scope here.
#[async_trait]
pub trait VpnHelper: Send + Sync {
    async fn status(&self) -> Result<VpnStatus, VpnError>;
}

/// Lowest and highest valid forwarded port values;
/// anything outside this range is treated as "no port".
const VALID_PORT_RANGE: std::ops::RangeInclusive<u16> = 1024..=65535;

fn is_valid_forwarded_port(port: u16) -> bool {
    VALID_PORT_RANGE.contains(&port)
}

pub struct VpnReadiness {
    helper: Arc<dyn VpnHelper>,
    peer: Arc<dyn PeerClient>,
    options: OptionsMonitor,
    ready: AtomicBool,
    /// Serializes in-flight status fetches: one at a time.
    fetch_lock: Mutex<()>,
    /// Serializes the "did we already apply this port" bookkeeping,
    /// deliberately a second lock distinct from `fetch_lock`.
    last_applied_port: Mutex<Option<u16>>,
}

impl VpnReadiness {
    pub fn new(helper: Arc<dyn VpnHelper>, peer: Arc<dyn PeerClient>, options: OptionsMonitor) -> Arc<Self> {
        Arc::new(Self {
            helper,
            peer,
            options,
            ready: AtomicBool::new(false),
            fetch_lock: Mutex::new(()),
            last_applied_port: Mutex::new(None),
        })
    }

    /// Ready iff connected, and either port forwarding is disabled or a
    /// valid forwarded port is in hand.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Runs one poll cycle: fetches status, updates readiness, applies a new
    /// forwarded port to the configuration overlay if it changed, and
    /// disconnects the peer client if VPN is required but not ready.
    pub async fn poll_once(&self) {
        let guard = match self.fetch_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return, // a fetch is already in flight
        };

        let status = match self.helper.status().await {
            Ok(status) => status,
            Err(err) => {
                log::warn!("vpn status fetch failed: {err}");
                return;
            }
        };
        drop(guard);

        let options = self.options.current();
        let port_requirement_met = options.vpn.port_forwarding_disabled
            || status.forwarded_port.is_some_and(is_valid_forwarded_port);
        let ready = status.is_connected && port_requirement_met;
        self.ready.store(ready, Ordering::SeqCst);

        if let Some(port) = status.forwarded_port.filter(|p| is_valid_forwarded_port(*p)) {
            let mut last_applied = self.last_applied_port.lock().await;
            if *last_applied != Some(port) {
                *last_applied = Some(port);
                drop(last_applied);
                let mut new_options = self.options.current();
                new_options.connection.listen_port = port;
                self.options.update(new_options);
                log::info!("vpn forwarded port changed, updating listen port to {port}");
            }
        }

        if options.vpn.required && !ready {
            self.peer.disconnect("VPN client disconnected").await;
        }
    }

    /// Spawns the periodic poller until `cancel` fires.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let readiness = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = readiness.options.current().vpn.poll_interval_secs;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs_f64(interval.max(0.1))) => {
                        readiness.poll_once().await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}
