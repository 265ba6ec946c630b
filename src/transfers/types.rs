//! Transfer data model.
//!
//! The state bitflag uses `bitflags!` over the transfer lifecycle's own
//! flag set, with a terminal-state monotonicity rule enforced on every
//! transition.

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type TransferId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Download => "Download",
            Direction::Upload => "Upload",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TransferState: u32 {
        const NONE          = 0;
        const REQUESTED     = 1 << 0;
        const QUEUED        = 1 << 1;
        const INITIALIZING  = 1 << 2;
        const IN_PROGRESS   = 1 << 3;
        const COMPLETED     = 1 << 4;
        const SUCCEEDED     = 1 << 5;
        const CANCELLED     = 1 << 6;
        const TIMED_OUT     = 1 << 7;
        const ERRORED       = 1 << 8;
        const REJECTED      = 1 << 9;
        const ABORTED       = 1 << 10;
        const LOCALLY       = 1 << 11;
        const REMOTELY      = 1 << 12;
    }
}

impl TransferState {
    /// Any of these bits being set means the transfer will make no further
    /// progress.
    pub const TERMINAL: TransferState = TransferState::COMPLETED
        .union(TransferState::CANCELLED)
        .union(TransferState::TIMED_OUT)
        .union(TransferState::ERRORED)
        .union(TransferState::REJECTED)
        .union(TransferState::ABORTED);

    pub fn is_terminal(&self) -> bool {
        self.intersects(TransferState::TERMINAL)
    }

    /// Textual mirror of the numeric flags, comma-joined in declaration
    /// order, kept consistent with `State` on every write.
    pub fn description(&self) -> String {
        const NAMED: &[(TransferState, &str)] = &[
            (TransferState::REQUESTED, "Requested"),
            (TransferState::QUEUED, "Queued"),
            (TransferState::INITIALIZING, "Initializing"),
            (TransferState::IN_PROGRESS, "InProgress"),
            (TransferState::COMPLETED, "Completed"),
            (TransferState::SUCCEEDED, "Succeeded"),
            (TransferState::CANCELLED, "Cancelled"),
            (TransferState::TIMED_OUT, "TimedOut"),
            (TransferState::ERRORED, "Errored"),
            (TransferState::REJECTED, "Rejected"),
            (TransferState::ABORTED, "Aborted"),
            (TransferState::LOCALLY, "Locally"),
            (TransferState::REMOTELY, "Remotely"),
        ];
        let parts: Vec<&str> = NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if parts.is_empty() {
            "None".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("transfer {id} is already in a terminal state and cannot transition to {attempted}")]
    TerminalStateIsMonotonic { id: TransferId, attempted: String },

    #[error("bytes_transferred ({bytes_transferred}) exceeds size ({size}) for transfer {id}")]
    BytesExceedSize { id: TransferId, bytes_transferred: u64, size: u64 },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("no transfer with id {0}")]
    NotFound(TransferId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub direction: Direction,
    pub username: String,
    pub filename: String,
    pub size: u64,
    pub start_offset: u64,
    pub bytes_transferred: u64,
    pub average_speed: f64,
    pub requested_at: DateTime<Utc>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub state: TransferState,
    pub attempts: i32,
    pub group_id: Option<String>,
    pub removed: bool,
    pub exception: Option<String>,
}

impl Transfer {
    pub fn new(direction: Direction, username: impl Into<String>, filename: impl Into<String>, size: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            username: username.into(),
            filename: filename.into(),
            size,
            start_offset: 0,
            bytes_transferred: 0,
            average_speed: 0.0,
            requested_at: Utc::now(),
            enqueued_at: None,
            started_at: None,
            ended_at: None,
            state: TransferState::REQUESTED,
            attempts: 0,
            group_id: None,
            removed: false,
            exception: None,
        }
    }

    pub fn state_description(&self) -> String {
        self.state.description()
    }

    /// Applies a new state, enforcing that a terminal state is monotonic:
    /// once any terminal bit is set, no further state transition is
    /// accepted, and `ended_at` is the only field the caller may still
    /// update directly afterward.
    pub fn transition(&mut self, new_state: TransferState) -> Result<(), TransferError> {
        if self.state.is_terminal() {
            return Err(TransferError::TerminalStateIsMonotonic {
                id: self.id,
                attempted: new_state.description(),
            });
        }
        self.state = new_state;
        if new_state.is_terminal() && self.started_at.is_some() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn set_bytes_transferred(&mut self, bytes: u64) -> Result<(), TransferError> {
        if bytes > self.size {
            return Err(TransferError::BytesExceedSize {
                id: self.id,
                bytes_transferred: bytes,
                size: self.size,
            });
        }
        self.bytes_transferred = bytes;
        Ok(())
    }
}
