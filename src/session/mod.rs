//! Recording sessions and the controller that drives them

mod controller;

pub use controller::{ControllerSettings, SessionController};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::capture::BackendKind;
use crate::error::{CaptureError, ErrorKind};

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initializing,
    Recording,
    Stopping,
    Finalizing,
    Completed,
    Failed,
}

impl SessionState {
    /// Completed and Failed sessions hold no resources
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    /// Whether a new session may begin from this state
    pub fn accepts_start(self) -> bool {
        self == SessionState::Idle || self.is_terminal()
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "Idle",
            SessionState::Initializing => "Initializing",
            SessionState::Recording => "Recording",
            SessionState::Stopping => "Stopping",
            SessionState::Finalizing => "Finalizing",
            SessionState::Completed => "Completed",
            SessionState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Terminal error recorded on a failed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&CaptureError> for SessionError {
    fn from(err: &CaptureError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// One start-to-terminal recording attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub state: SessionState,
    pub backend_kind: BackendKind,
    /// Set once the path resolver allocated a destination
    pub raw_output_path: Option<PathBuf>,
    /// Set only on successful completion
    pub final_output_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<SessionError>,
}

impl Session {
    pub(crate) fn new(backend_kind: BackendKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            backend_kind,
            raw_output_path: None,
            final_output_path: None,
            started_at: Utc::now(),
            ended_at: None,
            last_error: None,
        }
    }
}

/// Why a control call did not complete a session
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    /// The call was not valid in the current state and changed nothing
    #[error("{command} rejected while {state}")]
    Rejected {
        command: &'static str,
        state: SessionState,
    },

    #[error("session {session_id} failed: {source}")]
    Failed {
        session_id: Uuid,
        #[source]
        source: CaptureError,
    },
}

impl ControlError {
    pub fn is_rejected(&self) -> bool {
        matches!(self, ControlError::Rejected { .. })
    }
}
