//! capture-agent
//!
//! Headless camera recording. A [`SessionController`] runs one recording
//! session at a time on top of a capture backend (an in-process camera
//! driver or a supervised external capture tool), writes the result under a
//! unique timestamped name and optionally transcodes it. Progress and errors
//! are published on an [`EventBus`].

pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod session;
pub mod storage;
pub mod supervisor;
pub mod transcode;

pub use capture::{BackendKind, CaptureBackend, StreamConfig};
pub use config::Config;
pub use error::{CaptureError, ErrorKind};
pub use events::{Event, EventBus, EventKind, Severity};
pub use session::{ControlError, ControllerSettings, Session, SessionController, SessionState};
