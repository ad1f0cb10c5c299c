//! Capture backends
//!
//! A backend turns "record to this path" into video bytes on disk. Two
//! strategies exist behind one trait:
//! - [`SdkBackend`]: drives an in-process [`CameraDevice`]
//! - [`ProcessBackend`]: runs an external capture tool under the supervisor
//!
//! The session controller only ever sees `Box<dyn CaptureBackend>`.

mod backend;
mod process;
mod sdk;
mod test_pattern;

pub use backend::*;
pub use process::{ProcessBackend, ProcessCaptureSettings};
pub use sdk::{CameraDevice, DeviceError, SdkBackend};
pub use test_pattern::TestPatternCamera;
