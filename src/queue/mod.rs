//! Upload Queue: multi-group slot scheduler with
//! per-group queuing strategies and a global slot cap.
//!
//! An `Arc<Mutex<..>>`-guarded index plus a priority ordering, using a
//! per-group bag and a priority-then-strategy scan rather than a single
//! global heap, since slots are a per-group resource here.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::config::UploadOptions;

pub const DEFAULT_GROUP: &str = "default";
pub const LEECHERS_GROUP: &str = "leechers";
pub const PRIVILEGED_GROUP: &str = "privileged";

pub type TransferId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    FirstInFirstOut,
    RoundRobin,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::FirstInFirstOut
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("no enqueued entry for transfer {0}")]
    NoSuchEntry(TransferId),
    #[error("transfer {0} is already enqueued")]
    AlreadyEnqueued(TransferId),
}

#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub name: String,
    pub slots: u32,
    pub priority: u32,
    pub strategy: Strategy,
}

impl GroupSpec {
    /// Builds the always-present groups plus any user-defined groups from
    /// configuration.
    pub fn builtin_and_configured(options: &UploadOptions) -> Vec<GroupSpec> {
        let mut specs = vec![
            GroupSpec {
                name: DEFAULT_GROUP.to_string(),
                slots: options.max_slots,
                priority: 100,
                strategy: Strategy::FirstInFirstOut,
            },
            GroupSpec {
                name: LEECHERS_GROUP.to_string(),
                slots: 1,
                priority: 200,
                strategy: Strategy::RoundRobin,
            },
            GroupSpec {
                name: PRIVILEGED_GROUP.to_string(),
                slots: options.max_slots,
                priority: 0,
                strategy: Strategy::FirstInFirstOut,
            },
        ];
        for (name, group) in &options.groups {
            specs.push(GroupSpec {
                name: name.clone(),
                slots: group.slots,
                priority: group.priority,
                strategy: group.strategy,
            });
        }
        specs
    }
}

struct Entry {
    id: TransferId,
    enqueued_at: DateTime<Utc>,
    ready_at: Option<DateTime<Utc>>,
    completion: Option<oneshot::Sender<()>>,
}

struct GroupState {
    spec: GroupSpec,
    used_slots: u32,
    entries: Vec<Entry>,
}

struct QueueState {
    groups: HashMap<String, GroupState>,
    max_slots: u32,
    /// Maps a waiting entry's id to the group bag it currently lives in, so
    /// `ready`/`complete`/`cancel` don't need to scan every group.
    location: HashMap<TransferId, String>,
}

impl QueueState {
    fn total_used(&self) -> u32 {
        self.groups.values().map(|g| g.used_slots).sum()
    }

    fn resolve_group<'a>(&'a mut self, name: Option<&str>) -> &'a mut GroupState {
        let key = name
            .filter(|n| self.groups.contains_key(*n))
            .unwrap_or(DEFAULT_GROUP);
        self.groups.get_mut(key).expect("default group always present")
    }

    /// One scheduling pass: releases at most one entry per group, in
    /// ascending priority order, honoring the global cap and each group's
    /// strategy.
    fn process(&mut self) {
        if self.total_used() >= self.max_slots {
            return;
        }
        let any_ready = self.groups.values().any(|g| g.entries.iter().any(|e| e.ready_at.is_some()));
        if !any_ready {
            return;
        }

        let mut names: Vec<String> = self.groups.keys().cloned().collect();
        names.sort_by_key(|name| self.groups[name].spec.priority);

        for name in names {
            if self.total_used() >= self.max_slots {
                break;
            }
            let group = self.groups.get_mut(&name).unwrap();
            if group.used_slots >= group.spec.slots {
                continue;
            }
            let chosen_index = Self::pick_index(group);
            if let Some(index) = chosen_index {
                let mut entry = group.entries.remove(index);
                group.used_slots += 1;
                self.location.remove(&entry.id);
                if let Some(tx) = entry.completion.take() {
                    let _ = tx.send(());
                }
            }
        }
    }

    fn pick_index(group: &GroupState) -> Option<usize> {
        let ready_indices: Vec<usize> = group
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.ready_at.is_some())
            .map(|(i, _)| i)
            .collect();
        if ready_indices.is_empty() {
            return None;
        }
        match group.spec.strategy {
            Strategy::FirstInFirstOut => ready_indices
                .into_iter()
                .min_by(|&a, &b| cmp_times(group.entries[a].enqueued_at, group.entries[b].enqueued_at)),
            Strategy::RoundRobin => ready_indices.into_iter().min_by(|&a, &b| {
                cmp_times(
                    group.entries[a].ready_at.unwrap(),
                    group.entries[b].ready_at.unwrap(),
                )
            }),
        }
    }
}

fn cmp_times(a: DateTime<Utc>, b: DateTime<Utc>) -> Ordering {
    a.cmp(&b)
}

/// Multi-group slot scheduler. All mutation goes through a single mutex;
/// every public method locks, mutates, unlocks, then runs a fresh scheduling
/// pass, so `process` never re-enters a lock a caller already holds.
pub struct UploadQueue {
    state: Mutex<QueueState>,
}

impl UploadQueue {
    pub fn new(options: &UploadOptions) -> Self {
        Self {
            state: Mutex::new(Self::build_state(options)),
        }
    }

    fn build_state(options: &UploadOptions) -> QueueState {
        let mut groups = HashMap::new();
        for spec in GroupSpec::builtin_and_configured(options) {
            groups.insert(
                spec.name.clone(),
                GroupState {
                    spec,
                    used_slots: 0,
                    entries: Vec::new(),
                },
            );
        }
        QueueState {
            groups,
            max_slots: options.max_slots,
            location: HashMap::new(),
        }
    }

    /// Rebuilds the group dictionary, preserving `used_slots` for groups
    /// whose name survives the change. Renamed or removed groups forfeit
    /// their counts.
    pub async fn reconfigure(&self, options: &UploadOptions) {
        let mut state = self.state.lock().await;
        let mut new_state = Self::build_state(options);
        for (name, group) in &mut new_state.groups {
            if let Some(old) = state.groups.get(name) {
                group.used_slots = old.used_slots;
            }
        }
        *state = new_state;
    }

    /// Inserts a waiting entry into `group_name`'s bag (or `default` if
    /// `group_name` doesn't resolve) and triggers a processing pass.
    pub async fn enqueue(&self, id: TransferId, group_name: Option<&str>) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.location.contains_key(&id) {
            return Err(QueueError::AlreadyEnqueued(id));
        }
        let group = state.resolve_group(group_name);
        let group_name = group.spec.name.clone();
        group.entries.push(Entry {
            id,
            enqueued_at: Utc::now(),
            ready_at: None,
            completion: None,
        });
        state.location.insert(id, group_name);
        drop(state);
        self.state.lock().await.process();
        Ok(())
    }

    /// Marks an already-enqueued entry as ready and returns a receiver that
    /// resolves when the scheduler releases it.
    pub async fn ready(&self, id: TransferId) -> Result<oneshot::Receiver<()>, QueueError> {
        let mut state = self.state.lock().await;
        let group_name = state.location.get(&id).cloned().ok_or(QueueError::NoSuchEntry(id))?;
        let group = state.groups.get_mut(&group_name).expect("location is kept in sync");
        let entry = group
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(QueueError::NoSuchEntry(id))?;
        let (tx, rx) = oneshot::channel();
        entry.ready_at = Some(Utc::now());
        entry.completion = Some(tx);
        drop(state);
        self.state.lock().await.process();
        Ok(rx)
    }

    /// Decrements the used-slot count of the resolved group and triggers a
    /// processing pass. Never drives `used_slots` below zero.
    pub async fn complete(&self, group_name: Option<&str>) {
        let mut state = self.state.lock().await;
        let group = state.resolve_group(group_name);
        group.used_slots = group.used_slots.saturating_sub(1);
        drop(state);
        self.state.lock().await.process();
    }

    /// Removes a waiting (not yet released) entry without granting it a
    /// slot, so a cancelled upload never leaves an orphaned entry behind.
    pub async fn cancel(&self, id: TransferId) {
        let mut state = self.state.lock().await;
        if let Some(group_name) = state.location.remove(&id) {
            if let Some(group) = state.groups.get_mut(&group_name) {
                group.entries.retain(|e| e.id != id);
            }
        }
    }

    pub async fn used_slots(&self, group_name: &str) -> u32 {
        self.state.lock().await.groups.get(group_name).map(|g| g.used_slots).unwrap_or(0)
    }

    pub async fn total_used_slots(&self) -> u32 {
        self.state.lock().await.total_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use crate::config::GroupOptions;

    fn options_with_groups(max_slots: u32, groups: Map<String, GroupOptions>) -> UploadOptions {
        UploadOptions {
            speed_limit_kb_per_s: None,
            max_slots,
            groups,
        }
    }

    /// Mixed-group release order: higher-priority group drains first, then
    /// the lower-priority group once a slot frees up.
    #[tokio::test]
    async fn upload_queue_ordering_across_groups() {
        let mut groups = Map::new();
        groups.insert(
            "a".to_string(),
            GroupOptions { slots: 1, priority: 1, strategy: Strategy::FirstInFirstOut },
        );
        groups.insert(
            "b".to_string(),
            GroupOptions { slots: 2, priority: 2, strategy: Strategy::FirstInFirstOut },
        );
        let options = options_with_groups(2, groups);
        let queue = UploadQueue::new(&options);

        let a1 = Uuid::new_v4();
        let b1 = Uuid::new_v4();
        let a2 = Uuid::new_v4();

        queue.enqueue(a1, Some("a")).await.unwrap();
        queue.enqueue(b1, Some("b")).await.unwrap();
        queue.enqueue(a2, Some("a")).await.unwrap();

        let mut a1_rx = queue.ready(a1).await.unwrap();
        assert!(a1_rx.try_recv().is_ok(), "a1 should release immediately");

        let mut b1_rx = queue.ready(b1).await.unwrap();
        assert!(b1_rx.try_recv().is_ok(), "b1 should release immediately");

        let mut a2_rx = queue.ready(a2).await.unwrap();
        assert!(a2_rx.try_recv().is_err(), "a2 should still be queued, slot cap reached");

        queue.complete(Some("a")).await;
        assert!(a2_rx.try_recv().is_ok(), "a2 should release once a1 completes");
    }

    #[tokio::test]
    async fn per_group_slot_cap_is_respected() {
        let mut groups = Map::new();
        groups.insert("solo".to_string(), GroupOptions { slots: 1, priority: 0, strategy: Strategy::FirstInFirstOut });
        let options = options_with_groups(10, groups);
        let queue = UploadQueue::new(&options);

        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        queue.enqueue(t1, Some("solo")).await.unwrap();
        queue.enqueue(t2, Some("solo")).await.unwrap();

        let mut r1 = queue.ready(t1).await.unwrap();
        let mut r2 = queue.ready(t2).await.unwrap();
        assert!(r1.try_recv().is_ok());
        assert!(r2.try_recv().is_err());
    }

    #[tokio::test]
    async fn round_robin_releases_smallest_ready_at_first() {
        let mut groups = Map::new();
        groups.insert("rr".to_string(), GroupOptions { slots: 1, priority: 0, strategy: Strategy::RoundRobin });
        let options = options_with_groups(10, groups);
        let queue = UploadQueue::new(&options);

        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let t3 = Uuid::new_v4();
        queue.enqueue(t1, Some("rr")).await.unwrap();
        queue.enqueue(t2, Some("rr")).await.unwrap();
        queue.enqueue(t3, Some("rr")).await.unwrap();

        // t2 takes the single slot immediately.
        let mut r2 = queue.ready(t2).await.unwrap();
        assert!(r2.try_recv().is_ok());

        // t3 reaches ready_at before t1, while the slot is still occupied.
        let mut r3 = queue.ready(t3).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut r1 = queue.ready(t1).await.unwrap();
        assert!(r3.try_recv().is_err());
        assert!(r1.try_recv().is_err());

        // Freeing the slot should release t3, the oldest ready entry, not t1.
        queue.complete(Some("rr")).await;
        assert!(r3.try_recv().is_ok(), "t3 reached ready_at first, should win under RR");
        assert!(r1.try_recv().is_err());
    }

    #[tokio::test]
    async fn ready_on_unknown_entry_errors() {
        let options = UploadOptions::default();
        let queue = UploadQueue::new(&options);
        let result = queue.ready(Uuid::new_v4()).await;
        assert!(matches!(result, Err(QueueError::NoSuchEntry(_))));
    }

    #[tokio::test]
    async fn cancel_removes_waiting_entry() {
        let options = UploadOptions::default();
        let queue = UploadQueue::new(&options);
        let id = Uuid::new_v4();
        queue.enqueue(id, None).await.unwrap();
        queue.cancel(id).await;
        assert!(matches!(queue.ready(id).await, Err(QueueError::NoSuchEntry(_))));
    }

    #[tokio::test]
    async fn complete_never_goes_negative() {
        let options = UploadOptions::default();
        let queue = UploadQueue::new(&options);
        queue.complete(Some(DEFAULT_GROUP)).await;
        assert_eq!(queue.used_slots(DEFAULT_GROUP).await, 0);
    }

    #[tokio::test]
    async fn reconfigure_preserves_used_slots_for_surviving_groups() {
        let mut groups = Map::new();
        groups.insert("keep".to_string(), GroupOptions { slots: 5, priority: 0, strategy: Strategy::FirstInFirstOut });
        let options = options_with_groups(10, groups.clone());
        let queue = UploadQueue::new(&options);

        let id = Uuid::new_v4();
        queue.enqueue(id, Some("keep")).await.unwrap();
        let mut rx = queue.ready(id).await.unwrap();
        assert!(rx.try_recv().is_ok());
        assert_eq!(queue.used_slots("keep").await, 1);

        let mut new_groups = groups;
        new_groups.get_mut("keep").unwrap().slots = 8;
        let new_options = options_with_groups(10, new_groups);
        queue.reconfigure(&new_options).await;

        assert_eq!(queue.used_slots("keep").await, 1);
    }

    #[tokio::test]
    async fn unmapped_group_falls_back_to_default() {
        let options = UploadOptions::default();
        let queue = UploadQueue::new(&options);
        let id = Uuid::new_v4();
        queue.enqueue(id, Some("does-not-exist")).await.unwrap();
        let mut rx = queue.ready(id).await.unwrap();
        assert!(rx.try_recv().is_ok());
        assert_eq!(queue.used_slots(DEFAULT_GROUP).await, 1);
    }
}
