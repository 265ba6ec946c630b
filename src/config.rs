//! Layered daemon configuration.
//!
//! A serde struct with field-level defaults, loaded from an optional TOML
//! file and overlaid with environment variables, then published on a
//! `watch` channel so subsystems (the watchdog, the governor) can react to
//! changes without polling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::queue::Strategy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionOptions {
    #[serde(default = "default_address")]
    pub address: Option<String>,
    #[serde(default = "default_port")]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_address() -> Option<String> {
    None
}
fn default_port() -> Option<u16> {
    None
}
fn default_listen_port() -> u16 {
    2234
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            listen_port: default_listen_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupOptions {
    #[serde(default = "default_slots")]
    pub slots: u32,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub strategy: Strategy,
}

fn default_slots() -> u32 {
    1
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            priority: 0,
            strategy: Strategy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadOptions {
    /// Global outbound speed limit, in KiB/s. `None`/`0` disables throttling.
    #[serde(default)]
    pub speed_limit_kb_per_s: Option<u64>,
    #[serde(default = "default_max_slots")]
    pub max_slots: u32,
    #[serde(default)]
    pub groups: HashMap<String, GroupOptions>,
}

fn default_max_slots() -> u32 {
    25
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            speed_limit_kb_per_s: None,
            max_slots: default_max_slots(),
            groups: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VpnOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_vpn_poll_secs")]
    pub poll_interval_secs: f64,
    #[serde(default)]
    pub helper_endpoint: Option<String>,
    #[serde(default = "default_true")]
    pub port_forwarding_disabled: bool,
}

fn default_vpn_poll_secs() -> f64 {
    2.5
}
fn default_true() -> bool {
    true
}

impl Default for VpnOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            required: false,
            poll_interval_secs: default_vpn_poll_secs(),
            helper_endpoint: None,
            port_forwarding_disabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageOptions {
    #[serde(default = "default_db_dir")]
    pub database_directory: PathBuf,
    #[serde(default = "default_history_path")]
    pub migration_history_path: PathBuf,
}

fn default_db_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_history_path() -> PathBuf {
    PathBuf::from("data/migration.history")
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            database_directory: default_db_dir(),
            migration_history_path: default_history_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Options {
    #[serde(default)]
    pub connection: ConnectionOptions,
    #[serde(default)]
    pub uploads: UploadOptions,
    #[serde(default)]
    pub vpn: VpnOptions,
    #[serde(default)]
    pub storage: StorageOptions,
    /// Search records older than this with no activity are force-cancelled.
    #[serde(default = "default_search_inactivity_secs")]
    pub search_inactivity_timeout_secs: u64,
}

fn default_search_inactivity_secs() -> u64 {
    600
}

impl Default for Options {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            uploads: UploadOptions::default(),
            vpn: VpnOptions::default(),
            storage: StorageOptions::default(),
            search_inactivity_timeout_secs: default_search_inactivity_secs(),
        }
    }
}

impl Options {
    /// Candidate configuration file locations, searched in order when no
    /// explicit path is given: the current directory, then the user's
    /// platform config directory.
    pub fn default_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("slsk-brokerd.toml")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("slsk-brokerd").join("config.toml"));
        }
        paths
    }

    /// Load defaults, then overlay a TOML file if present, then environment
    /// variables. Read/parse errors on an explicitly-named file are
    /// propagated; a missing default path silently falls back to defaults.
    ///
    /// With `path: None`, `default_config_paths` is searched and the first
    /// existing file wins; if none exist, defaults are used untouched.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut options = Options::default();

        let resolved = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_config_paths().into_iter().find(|p| p.exists()),
        };

        if let Some(path) = resolved {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
            options = toml::from_str(&text)
                .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
        }

        if let Ok(username) = std::env::var("SLSK_USERNAME") {
            options.connection.username = username;
        }
        if let Ok(password) = std::env::var("SLSK_PASSWORD") {
            options.connection.password = password;
        }

        Ok(options)
    }

    /// Returns true iff `other` differs from `self` in a field the watchdog's
    /// reconnect loop actually depends on, so it restarts on connection
    /// changes only and not on every config write.
    pub fn connection_relevant_diff(&self, other: &Options) -> bool {
        self.connection != other.connection
    }
}

/// Publish/subscribe wrapper around a `watch` channel of immutable snapshots,
/// used in place of a dependency-injected configuration-change notification.
#[derive(Clone)]
pub struct OptionsMonitor {
    tx: watch::Sender<Options>,
}

impl OptionsMonitor {
    pub fn new(initial: Options) -> (Self, watch::Receiver<Options>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, rx)
    }

    pub fn current(&self) -> Options {
        self.tx.borrow().clone()
    }

    /// Hands out an additional receiver, for subsystems beyond the one that
    /// consumed the receiver returned by `new` (e.g. the upload governor and
    /// queue listening for speed-limit/group changes alongside the
    /// watchdog's connection-subtree listener).
    pub fn subscribe(&self) -> watch::Receiver<Options> {
        self.tx.subscribe()
    }

    /// Publishes a new snapshot. No-op (no receivers woken) if the value is
    /// unchanged, since `watch::Sender::send` still notifies on equal values;
    /// callers that care about that distinction should compare beforehand.
    pub fn update(&self, options: Options) {
        let _ = self.tx.send(options);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let options = Options::default();
        assert_eq!(options.uploads.max_slots, 25);
        assert_eq!(options.vpn.poll_interval_secs, 2.5);
        assert!(options.vpn.port_forwarding_disabled);
    }

    #[test]
    fn connection_relevant_diff_ignores_unrelated_fields() {
        let a = Options::default();
        let mut b = Options::default();
        b.uploads.max_slots = 99;
        assert!(!a.connection_relevant_diff(&b));

        let mut c = Options::default();
        c.connection.username = "someone".into();
        assert!(a.connection_relevant_diff(&c));
    }

    #[test]
    fn load_missing_path_falls_back_to_defaults() {
        let options = Options::load(None).unwrap();
        assert_eq!(options, Options::default());
    }

    #[test]
    fn load_parses_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [connection]
            username = "alice"
            password = "hunter2"

            [uploads]
            max_slots = 10
            "#,
        )
        .unwrap();

        let options = Options::load(Some(&path)).unwrap();
        assert_eq!(options.connection.username, "alice");
        assert_eq!(options.uploads.max_slots, 10);
    }
}
