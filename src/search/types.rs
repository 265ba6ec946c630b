//! Search data model.

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type SearchId = Uuid;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SearchState: u32 {
        const REQUESTED              = 1 << 0;
        const IN_PROGRESS            = 1 << 1;
        const COMPLETED              = 1 << 2;
        const CANCELLED              = 1 << 3;
        const TIMED_OUT              = 1 << 4;
        const RESPONSE_LIMIT_REACHED = 1 << 5;
        const FILE_LIMIT_REACHED     = 1 << 6;
        const ERRORED                = 1 << 7;
    }
}

impl SearchState {
    pub const TERMINAL: SearchState = SearchState::COMPLETED
        .union(SearchState::CANCELLED)
        .union(SearchState::TIMED_OUT)
        .union(SearchState::ERRORED);

    pub fn is_terminal(&self) -> bool {
        self.intersects(SearchState::TERMINAL)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

/// A file list from a given peer, returned in response to a search query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub username: String,
    pub token: u32,
    pub has_free_upload_slot: bool,
    pub queue_length: u32,
    pub upload_speed: u64,
    pub files: Vec<FileEntry>,
    pub locked_files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRecord {
    pub id: SearchId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub search_text: String,
    pub token: u32,
    pub state: SearchState,
    pub response_count: u32,
    pub file_count: u32,
    pub locked_file_count: u32,
    /// Present only when explicitly requested; `None` on every row returned by default and on every hub
    /// broadcast after the initial `Created` event.
    pub responses: Option<Vec<Response>>,
}

impl From<crate::peer::PeerFile> for FileEntry {
    fn from(file: crate::peer::PeerFile) -> Self {
        Self { name: file.name, size: file.size }
    }
}

impl From<crate::peer::PeerResponse> for Response {
    fn from(response: crate::peer::PeerResponse) -> Self {
        Self {
            username: response.username,
            token: response.token,
            has_free_upload_slot: response.has_free_upload_slot,
            queue_length: response.queue_length,
            upload_speed: response.upload_speed,
            files: response.files.into_iter().map(Into::into).collect(),
            locked_files: response.locked_files.into_iter().map(Into::into).collect(),
        }
    }
}

impl SearchRecord {
    pub fn new(id: SearchId, search_text: impl Into<String>, token: u32) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            ended_at: None,
            search_text: search_text.into(),
            token,
            state: SearchState::REQUESTED,
            response_count: 0,
            file_count: 0,
            locked_file_count: 0,
            responses: Some(Vec::new()),
        }
    }

    /// Returns a copy with `responses` elided, the shape `Find`/`List`
    /// return unless `include_responses` is set, and the shape every hub
    /// broadcast but the initial `Created` event carries.
    pub fn without_responses(&self) -> Self {
        let mut copy = self.clone();
        copy.responses = None;
        copy
    }
}
