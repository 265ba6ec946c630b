//! Application wiring: assembles the coordination
//! subsystems into a single handle, running schema migrations to completion
//! before anything else touches storage, then starting the background tasks
//! (reconnect loop, VPN poller, options listeners).
//!
//! One fallible constructor wires dependencies in the right order and hands
//! back `Arc`-shared handles an outer HTTP layer would depend on, since this
//! daemon has no HTTP server of its own.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{Options, OptionsMonitor};
use crate::governor::UploadGovernor;
use crate::hub::Hub;
use crate::migrate::{migrations, Migrator};
use crate::peer::PeerClient;
use crate::queue::UploadQueue;
use crate::search::{SearchService, SearchStore};
use crate::transfers::{TransferTracker, TransfersStore};
use crate::vpn::{VpnHelper, VpnReadiness};
use crate::watchdog::ConnectionWatchdog;

/// A fully wired daemon core. Each field is a handle an out-of-scope outer
/// layer (HTTP controllers, the CLI entry point) can clone and depend on
/// independently; `Daemon` itself owns only the startup/shutdown sequencing.
pub struct Daemon {
    pub options: OptionsMonitor,
    pub hub: Hub,
    pub transfers_store: Arc<TransfersStore>,
    pub transfer_tracker: Arc<TransferTracker>,
    pub search_service: SearchService,
    pub governor: Arc<UploadGovernor>,
    pub queue: Arc<UploadQueue>,
    pub watchdog: Arc<ConnectionWatchdog>,
    pub vpn: Option<Arc<VpnReadiness>>,
    background: CancellationToken,
}

impl Daemon {
    /// Runs migrations, opens the stores, and builds every subsystem. Does
    /// not start any background task; call `start` once construction
    /// succeeds. `vpn_helper` is `None` when VPN support isn't configured —
    /// the watchdog then skips the VPN-readiness gate entirely.
    pub fn new(options: Options, peer: Arc<dyn PeerClient>, vpn_helper: Option<Arc<dyn VpnHelper>>) -> anyhow::Result<Self> {
        Self::new_with_migration_mode(options, peer, vpn_helper, false)
    }

    /// Same as `new`, but `force_migrate=true` ignores the migration history
    /// file and reapplies every registered migration (each migration's own
    /// idempotence makes this safe; useful for `--force-migrate` recovery).
    pub fn new_with_migration_mode(
        options: Options,
        peer: Arc<dyn PeerClient>,
        vpn_helper: Option<Arc<dyn VpnHelper>>,
        force_migrate: bool,
    ) -> anyhow::Result<Self> {
        let migrator = Migrator::new(
            options.storage.database_directory.clone(),
            options.storage.migration_history_path.clone(),
            migrations::default_registry(),
        );
        migrator.run(force_migrate)?;

        let transfers_db_path = options.storage.database_directory.join("transfers.db");
        let search_db_path = options.storage.database_directory.join("search.db");
        let transfers_store = Arc::new(TransfersStore::open(&transfers_db_path)?);
        let search_store = SearchStore::open(&search_db_path)?;

        let hub = Hub::default();
        let transfer_tracker = Arc::new(TransferTracker::with_hub(Some(hub.clone())));
        let governor = Arc::new(UploadGovernor::new(&options.uploads));
        let queue = Arc::new(UploadQueue::new(&options.uploads));
        let search_service = SearchService::new(search_store, hub.clone(), peer.clone());

        let (options_monitor, connection_rx) = OptionsMonitor::new(options.clone());
        let uploads_rx = options_monitor.subscribe();

        let vpn = vpn_helper.map(|helper| VpnReadiness::new(helper, peer.clone(), options_monitor.clone()));
        let watchdog = ConnectionWatchdog::new(peer, vpn.clone(), options_monitor.clone());
        watchdog.spawn_options_listener(connection_rx);

        let background = CancellationToken::new();
        spawn_upload_options_listener(uploads_rx, Arc::clone(&governor), Arc::clone(&queue), background.child_token());

        Ok(Self {
            options: options_monitor,
            hub,
            transfers_store,
            transfer_tracker,
            search_service,
            governor,
            queue,
            watchdog,
            vpn,
            background,
        })
    }

    /// Starts the connection watchdog's reconnect loop and, if configured,
    /// the VPN readiness poller. Idempotent: a second call is a no-op on the
    /// watchdog side and simply re-spawns nothing on the VPN side since
    /// `spawn` is only ever invoked once here.
    pub fn start(&self) {
        self.watchdog.start();
        if let Some(vpn) = &self.vpn {
            vpn.spawn(self.background.child_token());
        }
    }

    /// Stops every background task. `abort` tears down an in-flight connect
    /// attempt immediately rather than letting it finish; the option-change
    /// listeners and VPN poller are always cancelled outright.
    pub async fn shutdown(&self, abort: bool) {
        self.watchdog.stop(abort).await;
        self.background.cancel();
    }
}

/// Reconfigures the governor and queue whenever the upload-relevant part of
/// configuration changes. Kept separate from the watchdog's own listener
/// since a speed-limit or group edit has nothing to do
/// with the connection subtree and shouldn't trigger a reconnect.
fn spawn_upload_options_listener(
    mut rx: tokio::sync::watch::Receiver<Options>,
    governor: Arc<UploadGovernor>,
    queue: Arc<UploadQueue>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut previous = rx.borrow().clone();
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let current = rx.borrow().clone();
                    if previous.uploads != current.uploads {
                        governor.reconfigure(&current.uploads).await;
                        queue.reconfigure(&current.uploads).await;
                    }
                    previous = current;
                }
                _ = cancel.cancelled() => return,
            }
        }
    })
}
