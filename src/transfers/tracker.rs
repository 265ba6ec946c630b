//! Transfer Tracker: an in-memory, three-level index of
//! active transfers by direction, username, and transfer id.
//!
//! Uses `dashmap::DashMap` at each nesting level rather than a single
//! `RwLock<HashMap<..>>`, since callback threads mutate this index
//! concurrently and a single global lock would serialize them needlessly.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::hub::{Hub, HubEvent};
use crate::transfers::types::{Direction, Transfer, TransferId};

/// A tracked transfer plus the handle used to cancel its in-flight attempt.
#[derive(Clone)]
pub struct TrackedTransfer {
    pub transfer: Transfer,
    pub cancel: CancellationToken,
}

type UserMap = DashMap<TransferId, TrackedTransfer>;
type DirectionMap = DashMap<String, UserMap>;

/// Three-level index: direction -> username -> transfer id -> tracked entry.
/// All mutations are safe under concurrent access from callback threads.
/// `hub`, when set, is published to on every add/remove, giving external
/// UIs the same kind of lifecycle push the Search Service provides.
#[derive(Default)]
pub struct TransferTracker {
    by_direction: DashMap<Direction, DirectionMap>,
    hub: Option<Hub>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::with_hub(None)
    }

    pub fn with_hub(hub: Option<Hub>) -> Self {
        let by_direction = DashMap::new();
        by_direction.insert(Direction::Download, DashMap::new());
        by_direction.insert(Direction::Upload, DashMap::new());
        Self { by_direction, hub }
    }

    /// Inserts or replaces the tuple for (direction, username, id).
    /// Publishes `TransferAdded` on first insertion and `TransferUpdated` on
    /// every subsequent call for the same id, if a hub is configured.
    pub fn add_or_update(&self, transfer: Transfer, cancel: CancellationToken) {
        let direction = transfer.direction;
        let username = transfer.username.clone();
        let id = transfer.id;
        // Entry always exists (seeded in `with_hub`), but fall back
        // defensively rather than panicking if a caller constructs the map
        // differently. Hold the `RefMut` guard into the live map; cloning a
        // `DashMap` deep-copies it, so writes through a clone never land here.
        let users = self.by_direction.entry(direction).or_insert_with(DashMap::new);
        let user_entries = users.entry(username).or_insert_with(DashMap::new);
        let existed = user_entries.contains_key(&id);
        user_entries.insert(id, TrackedTransfer { transfer: transfer.clone(), cancel });
        drop(user_entries);
        if let Some(hub) = &self.hub {
            hub.publish(if existed { HubEvent::TransferUpdated(transfer) } else { HubEvent::TransferAdded(transfer) });
        }
    }

    /// Returns a clone of the tracked entry, if present.
    pub fn try_get(&self, direction: Direction, username: &str, id: TransferId) -> Option<TrackedTransfer> {
        let users = self.by_direction.get(&direction)?;
        let entries = users.get(username)?;
        entries.get(&id).map(|e| e.clone())
    }

    /// Removes one entry, or every entry for (direction, username) when `id`
    /// is `None`. Removes the user's inner map once it empties. Publishes a
    /// `TransferRemoved` event per removed entry, if a hub is configured.
    pub fn try_remove(&self, direction: Direction, username: &str, id: Option<TransferId>) {
        let Some(users) = self.by_direction.get(&direction) else {
            return;
        };
        let Some(entries) = users.get(username) else {
            return;
        };
        let removed: Vec<Transfer> = match id {
            Some(id) => entries.remove(&id).into_iter().map(|(_, tracked)| tracked.transfer).collect(),
            None => {
                let all = entries.iter().map(|e| e.transfer.clone()).collect();
                entries.clear();
                all
            }
        };
        let is_empty = entries.is_empty();
        drop(entries);
        if is_empty {
            users.remove(username);
        }
        if let Some(hub) = &self.hub {
            for transfer in removed {
                hub.publish(HubEvent::TransferRemoved(transfer));
            }
        }
    }

    /// Linear scan of the user's entries for a matching filename.
    pub fn contains(&self, direction: Direction, username: &str, filename: &str) -> bool {
        let Some(users) = self.by_direction.get(&direction) else {
            return false;
        };
        let Some(entries) = users.get(username) else {
            return false;
        };
        entries.iter().any(|e| e.transfer.filename == filename)
    }

    /// Snapshot of every tracked transfer, for projection into the durable
    /// store or for API listing.
    pub fn snapshot(&self) -> Vec<Transfer> {
        let mut all = Vec::new();
        for direction_entry in self.by_direction.iter() {
            for user_entry in direction_entry.value().iter() {
                for tracked in user_entry.value().iter() {
                    all.push(tracked.transfer.clone());
                }
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(direction: Direction, username: &str, filename: &str) -> Transfer {
        Transfer::new(direction, username, filename, 100)
    }

    #[test]
    fn add_then_get_round_trips() {
        let tracker = TransferTracker::new();
        let transfer = sample(Direction::Download, "alice", "song.mp3");
        let id = transfer.id;
        tracker.add_or_update(transfer, CancellationToken::new());

        let found = tracker.try_get(Direction::Download, "alice", id);
        assert!(found.is_some());
        assert_eq!(found.unwrap().transfer.filename, "song.mp3");
    }

    #[test]
    fn try_get_absent_returns_none() {
        let tracker = TransferTracker::new();
        assert!(tracker.try_get(Direction::Upload, "bob", TransferId::new_v4()).is_none());
    }

    #[test]
    fn remove_single_id_keeps_siblings() {
        let tracker = TransferTracker::new();
        let a = sample(Direction::Upload, "carol", "a.bin");
        let b = sample(Direction::Upload, "carol", "b.bin");
        let (id_a, id_b) = (a.id, b.id);
        tracker.add_or_update(a, CancellationToken::new());
        tracker.add_or_update(b, CancellationToken::new());

        tracker.try_remove(Direction::Upload, "carol", Some(id_a));

        assert!(tracker.try_get(Direction::Upload, "carol", id_a).is_none());
        assert!(tracker.try_get(Direction::Upload, "carol", id_b).is_some());
    }

    #[test]
    fn remove_without_id_clears_user_and_drops_entry() {
        let tracker = TransferTracker::new();
        let a = sample(Direction::Download, "dave", "a.bin");
        let b = sample(Direction::Download, "dave", "b.bin");
        tracker.add_or_update(a, CancellationToken::new());
        tracker.add_or_update(b, CancellationToken::new());

        tracker.try_remove(Direction::Download, "dave", None);

        assert!(!tracker.contains(Direction::Download, "dave", "a.bin"));
        assert!(!tracker.contains(Direction::Download, "dave", "b.bin"));
    }

    #[test]
    fn contains_checks_filename_within_user_scope() {
        let tracker = TransferTracker::new();
        let transfer = sample(Direction::Upload, "erin", "movie.mkv");
        tracker.add_or_update(transfer, CancellationToken::new());

        assert!(tracker.contains(Direction::Upload, "erin", "movie.mkv"));
        assert!(!tracker.contains(Direction::Upload, "erin", "other.mkv"));
        assert!(!tracker.contains(Direction::Download, "erin", "movie.mkv"));
    }

    #[test]
    fn snapshot_flattens_every_entry() {
        let tracker = TransferTracker::new();
        tracker.add_or_update(sample(Direction::Download, "a", "x"), CancellationToken::new());
        tracker.add_or_update(sample(Direction::Upload, "b", "y"), CancellationToken::new());
        assert_eq!(tracker.snapshot().len(), 2);
    }

    /// First insertion publishes `TransferAdded`, a subsequent update for the
    /// same id publishes `TransferUpdated`, and removal publishes
    /// `TransferRemoved` — mirroring the Search Service's hub broadcasts.
    #[tokio::test]
    async fn hub_receives_added_updated_and_removed_events() {
        use crate::hub::{Hub, HubEvent};

        let hub = Hub::default();
        let mut rx = hub.subscribe();
        let tracker = TransferTracker::with_hub(Some(hub));

        let mut transfer = sample(Direction::Download, "gina", "a.bin");
        let id = transfer.id;
        tracker.add_or_update(transfer.clone(), CancellationToken::new());
        assert!(matches!(rx.recv().await.unwrap(), HubEvent::TransferAdded(t) if t.id == id));

        transfer.bytes_transferred = 10;
        tracker.add_or_update(transfer, CancellationToken::new());
        assert!(matches!(rx.recv().await.unwrap(), HubEvent::TransferUpdated(t) if t.id == id));

        tracker.try_remove(Direction::Download, "gina", Some(id));
        assert!(matches!(rx.recv().await.unwrap(), HubEvent::TransferRemoved(t) if t.id == id));
    }
}
