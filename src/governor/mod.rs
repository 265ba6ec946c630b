//! Upload Governor: routes in-flight uploads to a
//! per-group token bucket and rebuilds all buckets atomically on
//! reconfiguration.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bucket::TokenBucket;
use crate::config::UploadOptions;
use crate::queue::{GroupSpec, DEFAULT_GROUP};

struct Buckets {
    by_group: HashMap<String, Arc<TokenBucket>>,
    cancel: CancellationToken,
}

/// Per-group token-bucket rate limiter for outbound bytes.
pub struct UploadGovernor {
    buckets: RwLock<Buckets>,
}

impl UploadGovernor {
    pub fn new(options: &UploadOptions) -> Self {
        Self {
            buckets: RwLock::new(Self::build(options)),
        }
    }

    fn build(options: &UploadOptions) -> Buckets {
        let cancel = CancellationToken::new();
        let mut by_group = HashMap::new();
        for group in GroupSpec::builtin_and_configured(options) {
            let bucket = Arc::new(TokenBucket::from_speed_limit_kb_per_s(options.speed_limit_kb_per_s));
            bucket.spawn_replenisher(cancel.child_token());
            by_group.insert(group.name, bucket);
        }
        Buckets { by_group, cancel }
    }

    /// Rebuilds every bucket from scratch in one swap. In-flight transfers
    /// briefly observe a refilled bucket afterward, which is acceptable.
    pub async fn reconfigure(&self, options: &UploadOptions) {
        let new_buckets = Self::build(options);
        let mut guard = self.buckets.write().await;
        let old = std::mem::replace(&mut *guard, new_buckets);
        old.cancel.cancel();
    }

    fn resolve<'a>(buckets: &'a Buckets, group_name: Option<&str>) -> Arc<TokenBucket> {
        group_name
            .and_then(|name| buckets.by_group.get(name))
            .or_else(|| buckets.by_group.get(DEFAULT_GROUP))
            .cloned()
            .expect("default group bucket always present")
    }

    /// Requests `requested` bytes of outbound budget for `group_name`,
    /// suspending until at least one byte is available.
    pub async fn get(
        &self,
        group_name: Option<&str>,
        requested: u64,
        cancel: &CancellationToken,
    ) -> Option<u64> {
        let bucket = {
            let buckets = self.buckets.read().await;
            Self::resolve(&buckets, group_name)
        };
        bucket.get(requested, cancel).await
    }

    /// Returns unused bytes after a transfer attempt. Computes
    /// `max(0, granted - actual)`, so genuinely unused bytes are credited
    /// back to the bucket (a naive `min(0, ...)` would always yield zero).
    pub async fn return_bytes(&self, group_name: Option<&str>, granted: u64, actual: u64) {
        let waste = granted.saturating_sub(actual);
        if waste == 0 {
            return;
        }
        let bucket = {
            let buckets = self.buckets.read().await;
            Self::resolve(&buckets, group_name)
        };
        bucket.give_back(waste).await;
    }
}
