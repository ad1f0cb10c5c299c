//! In-process camera backend
//!
//! Wraps a stateful [`CameraDevice`]. The device is opened lazily on the
//! first acquisition and stays open between sessions. It is released when
//! the app is sent to the background and re-opened, with the same
//! configuration, when it returns.

use async_trait::async_trait;
use std::path::Path;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{AcquireHandle, BackendKind, BackendSignal, CaptureBackend, StreamConfig};
use crate::error::{AcquisitionCause, CaptureError};

/// Errors reported by camera drivers
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device busy: {0}")]
    Busy(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("device not ready: {0}")]
    NotReady(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Map a driver error onto the acquisition taxonomy
    fn into_acquisition(self, device: &str) -> CaptureError {
        let cause = match &self {
            DeviceError::Busy(_) => AcquisitionCause::DeviceBusy,
            DeviceError::PermissionDenied(_) => AcquisitionCause::PermissionDenied,
            DeviceError::NotFound(_) => AcquisitionCause::DeviceNotFound,
            DeviceError::Unsupported(_) => AcquisitionCause::Unsupported,
            DeviceError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                AcquisitionCause::PermissionDenied
            }
            DeviceError::NotReady(_) | DeviceError::Io(_) => AcquisitionCause::Other,
        };
        CaptureError::acquisition(cause, format!("{}: {}", device, self))
    }
}

/// Trait for camera drivers
#[async_trait]
pub trait CameraDevice: Send {
    fn name(&self) -> &str;

    /// Open the device and report the stream formats it supports
    async fn open(&mut self) -> Result<Vec<StreamConfig>, DeviceError>;

    async fn configure(&mut self, config: &StreamConfig) -> Result<(), DeviceError>;

    /// Start writing video to `destination`.
    ///
    /// Returns once the file exists and holds data. Faults that happen later
    /// are delivered on the returned receiver.
    async fn start_recording(
        &mut self,
        destination: &Path,
    ) -> Result<oneshot::Receiver<DeviceError>, DeviceError>;

    /// Stop writing; the file is flushed and closed when this returns.
    /// Returns the number of bytes written.
    async fn stop_recording(&mut self) -> Result<u64, DeviceError>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceStatus {
    Closed,
    Open,
    /// Released for the background; `reopen` records whether it was open
    Suspended { reopen: bool },
}

pub struct SdkBackend<D> {
    device: D,
    stream: StreamConfig,
    extension: String,
    status: DeviceStatus,
    recording: Option<Uuid>,
}

impl<D: CameraDevice> SdkBackend<D> {
    pub fn new(device: D, stream: StreamConfig, extension: impl Into<String>) -> Self {
        Self {
            device,
            stream,
            extension: extension.into(),
            status: DeviceStatus::Closed,
            recording: None,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Open and configure the device, negotiating the requested format
    async fn ensure_open(&mut self) -> Result<(), CaptureError> {
        if self.status == DeviceStatus::Open {
            return Ok(());
        }

        let name = self.device.name().to_string();
        let modes = self
            .device
            .open()
            .await
            .map_err(|e| e.into_acquisition(&name))?;

        if !modes.contains(&self.stream) {
            self.device.close().await;
            let supported: Vec<_> = modes.iter().map(|m| m.to_string()).collect();
            return Err(CaptureError::acquisition(
                AcquisitionCause::Unsupported,
                format!(
                    "{} does not support {} (supported: {})",
                    name,
                    self.stream,
                    supported.join(", ")
                ),
            ));
        }

        if let Err(e) = self.device.configure(&self.stream).await {
            self.device.close().await;
            return Err(e.into_acquisition(&name));
        }

        info!("Opened {} at {}", name, self.stream);
        self.status = DeviceStatus::Open;
        Ok(())
    }
}

#[async_trait]
impl<D: CameraDevice> CaptureBackend for SdkBackend<D> {
    fn kind(&self) -> BackendKind {
        BackendKind::Sdk
    }

    fn output_extension(&self) -> &str {
        &self.extension
    }

    fn stream_config(&self) -> StreamConfig {
        self.stream
    }

    async fn acquire(
        &mut self,
        destination: &Path,
        session_id: Uuid,
    ) -> Result<AcquireHandle, CaptureError> {
        if self.recording.is_some() {
            return Err(CaptureError::acquisition(
                AcquisitionCause::AlreadyAcquired,
                "camera is already recording",
            ));
        }
        if matches!(self.status, DeviceStatus::Suspended { .. }) {
            return Err(CaptureError::acquisition(
                AcquisitionCause::DeviceBusy,
                "camera was released while in the background",
            ));
        }

        self.stream.validate()?;
        self.ensure_open().await?;

        let name = self.device.name().to_string();
        let faults = self
            .device
            .start_recording(destination)
            .await
            .map_err(|e| e.into_acquisition(&name))?;
        self.recording = Some(session_id);

        let (signal_tx, signal_rx) = oneshot::channel();
        tokio::spawn(async move {
            if let Ok(fault) = faults.await {
                let _ = signal_tx.send(BackendSignal::Interrupted(
                    CaptureError::DeviceInterrupted(format!("{}: {}", name, fault)),
                ));
            }
        });

        Ok(AcquireHandle::new(session_id, destination.to_path_buf()).with_signals(signal_rx))
    }

    async fn finalize(&mut self, handle: AcquireHandle) -> Result<(), CaptureError> {
        if self.recording != Some(handle.session_id) {
            return Err(CaptureError::FinalizeError(format!(
                "camera is not recording session {}",
                handle.session_id
            )));
        }
        self.recording = None;

        let bytes = self
            .device
            .stop_recording()
            .await
            .map_err(|e| CaptureError::FinalizeError(format!("{}: {}", self.device.name(), e)))?;
        debug!("{} wrote {} bytes to {:?}", self.device.name(), bytes, handle.destination);
        Ok(())
    }

    async fn suspend(&mut self) -> Result<(), CaptureError> {
        if let DeviceStatus::Suspended { .. } = self.status {
            return Ok(());
        }

        if self.recording.take().is_some() {
            if let Err(e) = self.device.stop_recording().await {
                warn!("Stopping {} for background failed: {}", self.device.name(), e);
            }
        }

        let reopen = self.status == DeviceStatus::Open;
        if reopen {
            self.device.close().await;
        }
        info!("Released {} for background", self.device.name());
        self.status = DeviceStatus::Suspended { reopen };
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), CaptureError> {
        let DeviceStatus::Suspended { reopen } = self.status else {
            return Ok(());
        };

        self.status = DeviceStatus::Closed;
        if reopen {
            self.ensure_open().await?;
        }
        Ok(())
    }
}
