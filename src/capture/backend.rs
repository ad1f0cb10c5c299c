//! Capture backend trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::{Config, SdkDeviceKind};
use crate::error::{AcquisitionCause, CaptureError};
use crate::supervisor::Supervisor;

use super::process::{ProcessBackend, ProcessCaptureSettings};
use super::sdk::SdkBackend;
use super::test_pattern::TestPatternCamera;

/// Which acquisition strategy a controller uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process camera driver
    Sdk,
    /// External capture command
    #[default]
    Process,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sdk => f.write_str("sdk"),
            BackendKind::Process => f.write_str("process"),
        }
    }
}

/// Requested capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl StreamConfig {
    pub const MAX_DIMENSION: u32 = 7680;
    pub const MAX_FPS: u32 = 240;

    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self { width, height, fps }
    }

    /// Reject formats no encoder can produce.
    ///
    /// Invalid values fail the acquisition rather than being replaced by a
    /// default.
    pub fn validate(&self) -> Result<(), CaptureError> {
        let dims_ok = (2..=Self::MAX_DIMENSION).contains(&self.width)
            && (2..=Self::MAX_DIMENSION).contains(&self.height)
            && self.width % 2 == 0
            && self.height % 2 == 0;
        if !dims_ok {
            return Err(CaptureError::acquisition(
                AcquisitionCause::Unsupported,
                format!("resolution {}x{} is not supported", self.width, self.height),
            ));
        }
        if !(1..=Self::MAX_FPS).contains(&self.fps) {
            return Err(CaptureError::acquisition(
                AcquisitionCause::Unsupported,
                format!("frame rate {} is not supported", self.fps),
            ));
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new(1280, 720, 30)
    }
}

impl fmt::Display for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.fps)
    }
}

/// Something a backend reports about a recording after it started
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSignal {
    /// Capture finished on its own and the output is usable
    Ended(String),
    /// Capture broke while recording
    Interrupted(CaptureError),
}

/// Proof that a backend is producing bytes for a session
#[derive(Debug)]
pub struct AcquireHandle {
    pub session_id: Uuid,
    pub destination: PathBuf,
    signals: Option<oneshot::Receiver<BackendSignal>>,
}

impl AcquireHandle {
    pub fn new(session_id: Uuid, destination: PathBuf) -> Self {
        Self {
            session_id,
            destination,
            signals: None,
        }
    }

    pub fn with_signals(mut self, signals: oneshot::Receiver<BackendSignal>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Take the receiver for out-of-band backend signals
    pub fn take_signals(&mut self) -> Option<oneshot::Receiver<BackendSignal>> {
        self.signals.take()
    }
}

/// Trait for capture backends
#[async_trait]
pub trait CaptureBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Extension of the files this backend writes
    fn output_extension(&self) -> &str;

    /// The format requested from the hardware or tool
    fn stream_config(&self) -> StreamConfig;

    /// Begin producing video bytes at `destination`.
    ///
    /// Only one acquisition may be outstanding at a time.
    async fn acquire(
        &mut self,
        destination: &Path,
        session_id: Uuid,
    ) -> Result<AcquireHandle, CaptureError>;

    /// Stop production. The file is flushed and closed when this returns.
    async fn finalize(&mut self, handle: AcquireHandle) -> Result<(), CaptureError>;

    /// Release the device because the app went to the background.
    /// Any recording in progress is stopped.
    async fn suspend(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Re-acquire whatever `suspend` released, with the same configuration
    async fn resume(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }
}

/// Create the backend selected in the configuration
pub fn create_backend(config: &Config, supervisor: Supervisor) -> Box<dyn CaptureBackend> {
    let capture = &config.capture;
    let stream = capture.stream_config();
    let duration = capture.duration();

    match capture.backend {
        BackendKind::Process => {
            tracing::info!(
                "Using process backend ({}) at {}",
                capture.process.program,
                stream
            );
            let settings = ProcessCaptureSettings {
                program: capture.process.program.clone(),
                args: capture.process.args.clone(),
                output_extension: capture.process.output_extension.clone(),
                liveness_check: Duration::from_millis(capture.process.liveness_check_ms),
                accept_exit_codes: capture.process.accept_exit_codes.clone(),
            };
            Box::new(ProcessBackend::new(supervisor, settings, stream, duration))
        }
        BackendKind::Sdk => match capture.sdk.device {
            SdkDeviceKind::TestPattern => {
                tracing::info!("Using SDK backend (test pattern camera) at {}", stream);
                Box::new(SdkBackend::new(
                    TestPatternCamera::new(),
                    stream,
                    capture.sdk.output_extension.clone(),
                ))
            }
        },
    }
}
