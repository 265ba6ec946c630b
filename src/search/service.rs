//! Search Service: starts, throttles, streams, cancels,
//! and persists network-wide searches, broadcasting lifecycle events onto
//! the push hub.
//!
//! The in-memory `records` map is the live working copy consulted and
//! mutated by the streaming callback path; `store` is the durable
//! projection it's written through to, the same split of duties as the
//! Transfer Tracker/Transfers Store pair.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::hub::{Hub, HubEvent};
use crate::peer::{PeerClient, SearchEvent, SearchOptions, SearchScope};
use crate::search::store::{SearchStore, SearchStoreError};
use crate::search::types::{SearchId, SearchRecord, SearchState};

/// Coalescing window for counter writes and hub broadcasts per search.
const FLUSH_PERIOD: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search token {0} is already in use")]
    DuplicateToken(u32),
    #[error("too many requests: a search is already starting")]
    TooManyRequests,
    #[error("no search with id {0}")]
    NotFound(SearchId),
    #[error("search {0} is still active and cannot be deleted")]
    StillActive(SearchId),
    #[error("database error: {0}")]
    Store(#[from] SearchStoreError),
}

struct Inner {
    store: SearchStore,
    hub: Hub,
    peer: Arc<dyn PeerClient>,
    records: DashMap<SearchId, SearchRecord>,
    cancel_handles: DashMap<SearchId, CancellationToken>,
    /// Admits at most one concurrent `Start` per process.
    starting: Mutex<()>,
}

#[derive(Clone)]
pub struct SearchService(Arc<Inner>);

impl SearchService {
    pub fn new(store: SearchStore, hub: Hub, peer: Arc<dyn PeerClient>) -> Self {
        Self(Arc::new(Inner {
            store,
            hub,
            peer,
            records: DashMap::new(),
            cancel_handles: DashMap::new(),
            starting: Mutex::new(()),
        }))
    }

    /// Starts a network search, rejecting duplicate tokens and overlapping
    /// starts. Spawns the long-running peer search and returns immediately
    /// with the freshly created record.
    pub async fn start(&self, id: SearchId, query: String, scope: SearchScope, options: SearchOptions) -> Result<SearchRecord, SearchError> {
        let permit = self
            .0
            .starting
            .try_lock()
            .map_err(|_| SearchError::TooManyRequests)?;

        let token = self.0.peer.next_token();
        if self.0.store.token_in_use(token).await? {
            return Err(SearchError::DuplicateToken(token));
        }

        let record = SearchRecord::new(id, query.clone(), token);
        self.0.store.upsert(&record).await?;
        self.0.records.insert(id, record.clone());
        self.0.hub.publish(HubEvent::SearchCreated(record.clone()));
        drop(permit);

        let cancel = CancellationToken::new();
        self.0.cancel_handles.insert(id, cancel.clone());

        let events = self.0.peer.search(query, scope, token, options, cancel.clone()).await;
        let service = self.clone();
        tokio::spawn(async move { service.run(id, events, cancel).await });

        Ok(record)
    }

    async fn run(self, id: SearchId, mut events: mpsc::Receiver<SearchEvent>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(FLUSH_PERIOD);
        ticker.tick().await; // first tick fires immediately; skip it
        let mut dirty = false;

        loop {
            tokio::select! {
                received = events.recv() => {
                    match received {
                        Some(event) => {
                            if self.apply_event(id, event) {
                                self.finish(id).await;
                                break;
                            }
                            dirty = true;
                        }
                        None => {
                            self.apply_event(id, SearchEvent::Errored("peer client closed the search stream".to_string()));
                            self.finish(id).await;
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if dirty {
                        self.flush(id).await;
                        dirty = false;
                    }
                }
                _ = cancel.cancelled() => {
                    if let Some(mut entry) = self.0.records.get_mut(&id) {
                        entry.state |= SearchState::CANCELLED;
                    }
                    self.finish(id).await;
                    break;
                }
            }
        }

        self.0.cancel_handles.remove(&id);
    }

    /// Applies one streamed event to the in-memory working copy. Returns
    /// whether the search has reached a terminal state.
    fn apply_event(&self, id: SearchId, event: SearchEvent) -> bool {
        let Some(mut entry) = self.0.records.get_mut(&id) else {
            return true;
        };
        match event {
            SearchEvent::Response(response) => {
                entry.state |= SearchState::IN_PROGRESS;
                entry.response_count += 1;
                entry.file_count += response.files.len() as u32;
                entry.locked_file_count += response.locked_files.len() as u32;
                let response: crate::search::types::Response = response.into();
                match entry.responses.as_mut() {
                    Some(responses) => responses.push(response),
                    None => entry.responses = Some(vec![response]),
                }
                false
            }
            SearchEvent::Completed => {
                entry.state |= SearchState::COMPLETED;
                true
            }
            SearchEvent::TimedOut => {
                entry.state |= SearchState::TIMED_OUT;
                true
            }
            SearchEvent::ResponseLimitReached => {
                entry.state |= SearchState::RESPONSE_LIMIT_REACHED | SearchState::COMPLETED;
                true
            }
            SearchEvent::FileLimitReached => {
                entry.state |= SearchState::FILE_LIMIT_REACHED | SearchState::COMPLETED;
                true
            }
            SearchEvent::Errored(_) => {
                entry.state |= SearchState::ERRORED;
                true
            }
        }
    }

    /// Writes the current counters/state and broadcasts an update with
    /// responses elided. Persistence failure here is logged and swallowed:
    /// a later write may still succeed.
    async fn flush(&self, id: SearchId) {
        let Some(record) = self.0.records.get(&id).map(|r| r.clone()) else {
            return;
        };
        if let Err(err) = self.0.store.upsert(&record).await {
            log::error!("persistence failure while flushing search {id}: {err}");
        }
        self.0.hub.publish(HubEvent::SearchUpdated(record.without_responses()));
    }

    /// Terminal transition: sets `ended_at`, persists the final responses
    /// blob, then broadcasts with responses elided regardless of whether
    /// the write succeeded, so UIs converge even under persistence failure.
    async fn finish(&self, id: SearchId) {
        if let Some(mut entry) = self.0.records.get_mut(&id) {
            if entry.ended_at.is_none() {
                entry.ended_at = Some(Utc::now());
            }
        }
        let Some(record) = self.0.records.get(&id).map(|r| r.clone()) else {
            return;
        };
        if let Err(err) = self.0.store.upsert(&record).await {
            log::error!("persistence failure on terminal transition for search {id}: {err}");
        }
        self.0.hub.publish(HubEvent::SearchUpdated(record.without_responses()));
    }

    /// Strips responses unless `include_responses` is set.
    pub async fn list(&self, include_responses: bool) -> Result<Vec<SearchRecord>, SearchError> {
        Ok(self.0.store.list(include_responses).await?)
    }

    pub async fn find<F>(&self, include_responses: bool, predicate: F) -> Result<Option<SearchRecord>, SearchError>
    where
        F: Fn(&SearchRecord) -> bool,
    {
        Ok(self.list(include_responses).await?.into_iter().find(|r| predicate(r)))
    }

    /// Triggers the cancellation handle if the search is live; returns
    /// whether a handle existed.
    pub async fn try_cancel(&self, id: SearchId) -> bool {
        match self.0.cancel_handles.remove(&id) {
            Some((_, cancel)) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Terminal transition to `Cancelled` used by the API layer when a
    /// handle was already released but the record is still `Requested` past
    /// the configured inactivity timeout.
    pub async fn force_cancel(&self, id: SearchId) -> Result<SearchRecord, SearchError> {
        if !self.0.records.contains_key(&id) {
            if let Some(loaded) = self.0.store.get(id, true).await? {
                self.0.records.insert(id, loaded);
            } else {
                return Err(SearchError::NotFound(id));
            }
        }
        let mut entry = self.0.records.get_mut(&id).ok_or(SearchError::NotFound(id))?;
        entry.state |= SearchState::CANCELLED;
        entry.ended_at = Some(Utc::now());
        let record = entry.clone();
        drop(entry);
        self.0.store.upsert(&record).await?;
        self.0.hub.publish(HubEvent::SearchUpdated(record.without_responses()));
        Ok(record)
    }

    /// Removes the record and broadcasts a delete event. Must not be called
    /// on an active search; caller's responsibility.
    pub async fn delete(&self, id: SearchId) -> Result<(), SearchError> {
        if self.0.cancel_handles.contains_key(&id) {
            return Err(SearchError::StillActive(id));
        }
        let record = self
            .0
            .store
            .get(id, false)
            .await?
            .ok_or(SearchError::NotFound(id))?;
        self.0.records.remove(&id);
        self.0.store.delete(id).await?;
        self.0.hub.publish(HubEvent::SearchDeleted(record));
        Ok(())
    }
}
