//! Synthetic camera
//!
//! Produces moving colour bars as an uncompressed YUV4MPEG2 stream, so the
//! SDK path can be exercised on machines without camera hardware.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::backend::StreamConfig;
use super::sdk::{CameraDevice, DeviceError};

struct Recording {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<u64, DeviceError>>,
}

pub struct TestPatternCamera {
    modes: Vec<StreamConfig>,
    configured: Option<StreamConfig>,
    open: bool,
    recording: Option<Recording>,
}

impl TestPatternCamera {
    pub fn new() -> Self {
        let mut modes = Vec::new();
        for (width, height) in [(640, 480), (1280, 720), (1920, 1080)] {
            for fps in [15, 30] {
                modes.push(StreamConfig::new(width, height, fps));
            }
        }
        Self::with_modes(modes)
    }

    pub fn with_modes(modes: Vec<StreamConfig>) -> Self {
        Self {
            modes,
            configured: None,
            open: false,
            recording: None,
        }
    }
}

impl Default for TestPatternCamera {
    fn default() -> Self {
        Self::new()
    }
}

fn stream_header(config: &StreamConfig) -> String {
    format!(
        "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C420jpeg\n",
        config.width, config.height, config.fps
    )
}

/// Render one 4:2:0 frame; the bars shift by one column per frame
fn render_frame(config: &StreamConfig, index: u64, buf: &mut Vec<u8>) {
    const BARS: [(u8, u8, u8); 8] = [
        (235, 128, 128),
        (210, 16, 146),
        (170, 166, 16),
        (145, 54, 34),
        (106, 202, 222),
        (81, 90, 240),
        (41, 240, 110),
        (16, 128, 128),
    ];

    let width = config.width as usize;
    let height = config.height as usize;
    let bar_width = (width / BARS.len()).max(1);
    let offset = index as usize % width;
    let bar_at = |x: usize| BARS[((x + offset) % width / bar_width).min(BARS.len() - 1)];

    buf.clear();
    buf.extend_from_slice(b"FRAME\n");
    for _ in 0..height {
        buf.extend((0..width).map(|x| bar_at(x).0));
    }
    for _ in 0..height / 2 {
        buf.extend((0..width / 2).map(|x| bar_at(x * 2).1));
    }
    for _ in 0..height / 2 {
        buf.extend((0..width / 2).map(|x| bar_at(x * 2).2));
    }
}

async fn write_frames(
    mut writer: BufWriter<File>,
    config: StreamConfig,
    mut written: u64,
    mut stop_rx: oneshot::Receiver<()>,
    fault_tx: oneshot::Sender<DeviceError>,
) -> Result<u64, DeviceError> {
    let mut interval = tokio::time::interval(Duration::from_secs(1) / config.fps);
    // First tick completes immediately; frame 0 is already on disk
    interval.tick().await;

    let mut frame = Vec::new();
    let mut index = 1u64;
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = interval.tick() => {
                render_frame(&config, index, &mut frame);
                if let Err(e) = writer.write_all(&frame).await {
                    warn!("Test pattern write failed: {}", e);
                    let _ = fault_tx.send(DeviceError::Io(std::io::Error::new(e.kind(), e.to_string())));
                    return Err(DeviceError::Io(e));
                }
                written += frame.len() as u64;
                index += 1;
            }
        }
    }

    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    debug!("Test pattern stopped after {} frames", index);
    Ok(written)
}

#[async_trait]
impl CameraDevice for TestPatternCamera {
    fn name(&self) -> &str {
        "test-pattern"
    }

    async fn open(&mut self) -> Result<Vec<StreamConfig>, DeviceError> {
        if self.open {
            return Err(DeviceError::Busy("test pattern is already open".into()));
        }
        self.open = true;
        Ok(self.modes.clone())
    }

    async fn configure(&mut self, config: &StreamConfig) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotReady("device is not open".into()));
        }
        if !self.modes.contains(config) {
            return Err(DeviceError::Unsupported(config.to_string()));
        }
        self.configured = Some(*config);
        Ok(())
    }

    async fn start_recording(
        &mut self,
        destination: &Path,
    ) -> Result<oneshot::Receiver<DeviceError>, DeviceError> {
        let config = self
            .configured
            .ok_or_else(|| DeviceError::NotReady("device is not configured".into()))?;
        if self.recording.is_some() {
            return Err(DeviceError::Busy("already recording".into()));
        }

        let file = File::create(destination).await?;
        let mut writer = BufWriter::new(file);

        let header = stream_header(&config);
        let mut frame = Vec::new();
        render_frame(&config, 0, &mut frame);
        writer.write_all(header.as_bytes()).await?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        let written = (header.len() + frame.len()) as u64;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (fault_tx, fault_rx) = oneshot::channel();
        let task = tokio::spawn(write_frames(writer, config, written, stop_rx, fault_tx));
        self.recording = Some(Recording { stop_tx, task });

        Ok(fault_rx)
    }

    async fn stop_recording(&mut self) -> Result<u64, DeviceError> {
        let recording = self
            .recording
            .take()
            .ok_or_else(|| DeviceError::NotReady("not recording".into()))?;

        let _ = recording.stop_tx.send(());
        match recording.task.await {
            Ok(result) => result,
            Err(e) => Err(DeviceError::Io(std::io::Error::other(e.to_string()))),
        }
    }

    async fn close(&mut self) {
        if let Some(recording) = self.recording.take() {
            let _ = recording.stop_tx.send(());
            let _ = recording.task.await;
        }
        self.configured = None;
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_len(config: &StreamConfig) -> u64 {
        let luma = config.width as u64 * config.height as u64;
        b"FRAME\n".len() as u64 + luma + luma / 2
    }

    #[tokio::test]
    async fn test_records_valid_y4m() {
        let config = StreamConfig::new(640, 480, 30);
        let mut camera = TestPatternCamera::new();
        assert!(camera.open().await.unwrap().contains(&config));
        camera.configure(&config).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pattern.y4m");
        let _faults = camera.start_recording(&path).await.unwrap();

        // Header and first frame are on disk before start returns
        assert!(std::fs::metadata(&path).unwrap().len() > 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let written = camera.stop_recording().await.unwrap();
        camera.close().await;

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, written);

        let header = stream_header(&config);
        assert!(bytes.starts_with(header.as_bytes()));
        let body = written - header.len() as u64;
        assert_eq!(body % frame_len(&config), 0);
        assert!(body / frame_len(&config) >= 2);
    }

    #[tokio::test]
    async fn test_rejects_unknown_mode() {
        let mut camera = TestPatternCamera::new();
        camera.open().await.unwrap();
        let err = camera
            .configure(&StreamConfig::new(800, 600, 30))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_open_twice_is_busy() {
        let mut camera = TestPatternCamera::new();
        camera.open().await.unwrap();
        assert!(matches!(camera.open().await, Err(DeviceError::Busy(_))));
        camera.close().await;
        assert!(camera.open().await.is_ok());
    }

    #[test]
    fn test_frame_layout() {
        let config = StreamConfig::new(16, 8, 15);
        let mut frame = Vec::new();
        render_frame(&config, 3, &mut frame);
        assert_eq!(frame.len() as u64, frame_len(&config));
        assert!(frame.starts_with(b"FRAME\n"));
    }
}
