//! Connection Watchdog: keeps a single long-lived
//! session to the upstream server alive, reconnecting with bounded
//! exponential backoff and cooperating with VPN readiness.
//!
//! A non-blocking `Mutex::try_lock` single-flight guard around the
//! reconnect loop, a periodic backstop timer, and a `CancellationToken` per
//! in-flight attempt so `Stop(abort=true)` can abandon it without tearing
//! down the whole task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use std::sync::Mutex as StdMutex;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{Options, OptionsMonitor};
use crate::peer::{PeerClient, PeerClientError};
use crate::vpn::VpnReadiness;

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("connect attempt failed: {0}")]
    ConnectFailed(#[from] PeerClientError),
}

const BACKOFF_CEILING: Duration = Duration::from_millis(300_000);
const BACKOFF_BASE: u64 = 1_000;
const JITTER_CEILING_MS: u64 = 500;
const BACKSTOP_PERIOD: Duration = Duration::from_secs(5);

/// `delay = min(BACKOFF_BASE * 2^(attempt-1), ceiling) + jitter`, itself
/// clamped to `ceiling` so the mandatory jitter never pushes a sleep past
/// the 300 s bound.
fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let base_ms = BACKOFF_BASE.saturating_mul(1u64 << shift);
    let base = Duration::from_millis(base_ms).min(BACKOFF_CEILING);
    let jitter_ms = rand::thread_rng().gen_range(0..=JITTER_CEILING_MS);
    (base + Duration::from_millis(jitter_ms)).min(BACKOFF_CEILING)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogPhase {
    Stopped,
    Idle,
    Attempting,
}

#[derive(Debug, Clone)]
pub struct WatchdogSnapshot {
    pub phase: WatchdogPhase,
    pub attempt: u32,
    pub awaiting_vpn: bool,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Default for WatchdogSnapshot {
    fn default() -> Self {
        Self {
            phase: WatchdogPhase::Stopped,
            attempt: 0,
            awaiting_vpn: false,
            next_attempt_at: None,
        }
    }
}

pub struct ConnectionWatchdog {
    peer: Arc<dyn PeerClient>,
    vpn: Option<Arc<VpnReadiness>>,
    options: OptionsMonitor,
    enabled: AtomicBool,
    reconnect_lock: Mutex<()>,
    attempt_cancel: StdMutex<Option<CancellationToken>>,
    periodic_cancel: StdMutex<CancellationToken>,
    status_tx: watch::Sender<WatchdogSnapshot>,
}

impl ConnectionWatchdog {
    pub fn new(peer: Arc<dyn PeerClient>, vpn: Option<Arc<VpnReadiness>>, options: OptionsMonitor) -> Arc<Self> {
        let (status_tx, _) = watch::channel(WatchdogSnapshot::default());
        Arc::new(Self {
            peer,
            vpn,
            options,
            enabled: AtomicBool::new(false),
            reconnect_lock: Mutex::new(()),
            attempt_cancel: StdMutex::new(None),
            periodic_cancel: StdMutex::new(CancellationToken::new()),
            status_tx,
        })
    }

    pub fn status(&self) -> WatchdogSnapshot {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchdogSnapshot> {
        self.status_tx.subscribe()
    }

    fn set_status(&self, phase: WatchdogPhase, attempt: u32, awaiting_vpn: bool, next_attempt_at: Option<DateTime<Utc>>) {
        let _ = self.status_tx.send(WatchdogSnapshot { phase, attempt, awaiting_vpn, next_attempt_at });
    }

    /// Starts the reconnect loop and backstop timer. A no-op if already
    /// running.
    pub fn start(self: &Arc<Self>) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }

        let fresh_periodic = CancellationToken::new();
        *self.periodic_cancel.lock().unwrap() = fresh_periodic.clone();
        let periodic_for_task = fresh_periodic;

        let watchdog = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BACKSTOP_PERIOD);
            ticker.tick().await; // first tick fires immediately; consume it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if watchdog.enabled.load(Ordering::SeqCst) {
                            tokio::spawn(Arc::clone(&watchdog).run_reconnect_loop());
                        }
                    }
                    _ = periodic_for_task.cancelled() => break,
                }
            }
        });

        tokio::spawn(Arc::clone(self).run_reconnect_loop());
    }

    /// Disables the backstop timer first, then optionally trips the
    /// in-flight attempt's cancellation.
    pub async fn stop(&self, abort: bool) {
        self.enabled.store(false, Ordering::SeqCst);
        self.periodic_cancel.lock().unwrap().cancel();
        if abort {
            if let Some(cancel) = self.attempt_cancel.lock().unwrap().take() {
                cancel.cancel();
            }
        }
        self.set_status(WatchdogPhase::Stopped, 0, false, None);
    }

    /// Equivalent to `stop(abort=true)` followed by `start()`.
    pub async fn restart(self: &Arc<Self>) {
        self.stop(true).await;
        self.start();
    }

    /// Watches `rx` and restarts only on a connection-relevant change, so
    /// unrelated config writes (upload groups, VPN poll interval) never
    /// interrupt a live connection.
    pub fn spawn_options_listener(self: &Arc<Self>, mut rx: watch::Receiver<Options>) -> tokio::task::JoinHandle<()> {
        let watchdog = Arc::clone(self);
        tokio::spawn(async move {
            let mut previous = rx.borrow().clone();
            while rx.changed().await.is_ok() {
                let current = rx.borrow().clone();
                if previous.connection_relevant_diff(&current) {
                    watchdog.restart().await;
                }
                previous = current;
            }
        })
    }

    /// Issues a single connect attempt outside the backoff loop, for an
    /// administrative "reconnect now" request.
    pub async fn force_reconnect_now(&self) -> Result<(), WatchdogError> {
        let options = self.options.current();
        let cancel = CancellationToken::new();
        self.peer
            .connect(options.connection.address, options.connection.port, &options.connection.username, &options.connection.password, cancel)
            .await
            .map_err(WatchdogError::from)
    }

    async fn run_reconnect_loop(self: Arc<Self>) {
        let guard = match self.reconnect_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        let mut attempt: u32 = 0;
        loop {
            if !self.enabled.load(Ordering::SeqCst) {
                self.set_status(WatchdogPhase::Stopped, attempt, false, None);
                return;
            }
            if self.peer.is_connected() {
                self.set_status(WatchdogPhase::Idle, attempt, false, None);
                return;
            }

            let options = self.options.current();
            if let Some(vpn) = &self.vpn {
                if options.vpn.enabled && !vpn.is_ready() {
                    self.set_status(WatchdogPhase::Idle, attempt, true, None);
                    return;
                }
            }

            let cancel = CancellationToken::new();
            *self.attempt_cancel.lock().unwrap() = Some(cancel.clone());

            if attempt > 0 {
                let delay = backoff_delay(attempt);
                let next_attempt_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                self.set_status(WatchdogPhase::Attempting, attempt, false, Some(next_attempt_at));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        self.set_status(WatchdogPhase::Idle, attempt, false, None);
                        return;
                    }
                }
            } else {
                self.set_status(WatchdogPhase::Attempting, attempt, false, None);
            }

            let options = self.options.current();
            let result = self
                .peer
                .connect(options.connection.address, options.connection.port, &options.connection.username, &options.connection.password, cancel.clone())
                .await;

            *self.attempt_cancel.lock().unwrap() = None;

            match result {
                Ok(()) => {
                    self.set_status(WatchdogPhase::Idle, attempt, false, None);
                    return;
                }
                Err(PeerClientError::Cancelled) => {
                    self.set_status(WatchdogPhase::Idle, attempt, false, None);
                    return;
                }
                Err(err) => {
                    log::warn!("watchdog connect attempt failed: {err}");
                    attempt += 1;
                }
            }
        }
    }
}
