//! Configuration management for the capture agent

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{BackendKind, StreamConfig};
use crate::supervisor::StopSignal;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Capture backend and stream format
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Subprocess termination policy
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Post-capture conversion
    #[serde(default)]
    pub transcode: TranscodeConfig,

    /// Where recordings are written
    #[serde(default)]
    pub storage: StorageConfig,

    /// Event bus settings
    #[serde(default)]
    pub events: EventsConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Which backend records video
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Stop automatically after this long; 0 records until stopped
    #[serde(default)]
    pub duration_ms: u64,

    #[serde(default)]
    pub process: ProcessCaptureConfig,

    #[serde(default)]
    pub sdk: SdkCaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessCaptureConfig {
    /// Capture executable, looked up on PATH
    #[serde(default = "default_capture_program")]
    pub program: String,

    /// Argument template. Placeholders: {output}, {width}, {height}, {fps},
    /// {duration_ms}
    #[serde(default = "default_capture_args")]
    pub args: Vec<String>,

    #[serde(default = "default_capture_extension")]
    pub output_extension: String,

    /// How long the process must stay up before recording counts as started
    #[serde(default = "default_liveness_check")]
    pub liveness_check_ms: u64,

    /// Exit codes treated as a clean stop
    #[serde(default = "default_accept_exit_codes")]
    pub accept_exit_codes: Vec<i32>,
}

/// Camera drivers available to the SDK backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SdkDeviceKind {
    #[default]
    TestPattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkCaptureConfig {
    #[serde(default)]
    pub device: SdkDeviceKind,

    #[serde(default = "default_sdk_extension")]
    pub output_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Time between the stop signal and a forced kill (ms)
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,

    #[serde(default)]
    pub stop_signal: StopSignal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_transcode_program")]
    pub program: String,

    /// Argument template. Placeholders: {input}, {output}, {fps}
    #[serde(default = "default_transcode_args")]
    pub args: Vec<String>,

    #[serde(default = "default_transcode_extension")]
    pub output_extension: String,

    /// Delete the raw capture after a successful conversion
    #[serde(default = "default_true")]
    pub remove_source: bool,

    /// 0 disables the limit
    #[serde(default = "default_transcode_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Overrides the platform recordings directory
    pub output_directory: Option<PathBuf>,

    /// Keep the raw file of a failed session
    #[serde(default)]
    pub keep_partial_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast buffer; slower subscribers lag past this many events
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

// Default value functions
fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    30
}

fn default_capture_program() -> String {
    "libcamera-vid".to_string()
}

fn default_capture_args() -> Vec<String> {
    [
        "--nopreview",
        "-t",
        "{duration_ms}",
        "--width",
        "{width}",
        "--height",
        "{height}",
        "--framerate",
        "{fps}",
        "-o",
        "{output}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_capture_extension() -> String {
    "h264".to_string()
}

fn default_liveness_check() -> u64 {
    500
}

fn default_accept_exit_codes() -> Vec<i32> {
    vec![0]
}

fn default_sdk_extension() -> String {
    "y4m".to_string()
}

fn default_grace_period() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_transcode_program() -> String {
    "ffmpeg".to_string()
}

fn default_transcode_args() -> Vec<String> {
    [
        "-n",
        "-loglevel",
        "error",
        "-framerate",
        "{fps}",
        "-i",
        "{input}",
        "-c:v",
        "copy",
        "{output}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_transcode_extension() -> String {
    "mp4".to_string()
}

fn default_transcode_timeout() -> u64 {
    300
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            duration_ms: 0,
            process: ProcessCaptureConfig::default(),
            sdk: SdkCaptureConfig::default(),
        }
    }
}

impl Default for ProcessCaptureConfig {
    fn default() -> Self {
        Self {
            program: default_capture_program(),
            args: default_capture_args(),
            output_extension: default_capture_extension(),
            liveness_check_ms: default_liveness_check(),
            accept_exit_codes: default_accept_exit_codes(),
        }
    }
}

impl Default for SdkCaptureConfig {
    fn default() -> Self {
        Self {
            device: SdkDeviceKind::default(),
            output_extension: default_sdk_extension(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period(),
            stop_signal: StopSignal::default(),
        }
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: default_transcode_program(),
            args: default_transcode_args(),
            output_extension: default_transcode_extension(),
            remove_source: true,
            timeout_secs: default_transcode_timeout(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

impl CaptureConfig {
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig::new(self.width, self.height, self.fps)
    }

    /// Fixed recording length, if one is configured
    pub fn duration(&self) -> Option<Duration> {
        (self.duration_ms > 0).then(|| Duration::from_millis(self.duration_ms))
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let mut config = Config::default();
            config.config_path = Some(config_path);
            config.save()?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "capture-agent", "agent")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_gets_defaults() {
        let config: Config = toml::from_str(
            r#"
            [capture]
            backend = "sdk"
            fps = 15

            [supervisor]
            stop_signal = "terminate"
            "#,
        )
        .unwrap();

        assert_eq!(config.capture.backend, BackendKind::Sdk);
        assert_eq!(config.capture.stream_config(), StreamConfig::new(1280, 720, 15));
        assert_eq!(config.capture.duration(), None);
        assert_eq!(config.capture.process.program, "libcamera-vid");
        assert_eq!(config.capture.sdk.device, SdkDeviceKind::TestPattern);
        assert_eq!(config.supervisor.stop_signal, StopSignal::Terminate);
        assert_eq!(config.supervisor.grace_period(), Duration::from_secs(5));
        assert!(config.transcode.enabled);
        assert_eq!(config.events.capacity, 1024);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.config_path = Some(path.clone());
        config.capture.duration_ms = 10_000;
        config.storage.output_directory = Some(dir.path().join("recordings"));
        config.save().unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.capture.duration(), Some(Duration::from_secs(10)));
        assert_eq!(
            loaded.storage.output_directory,
            Some(dir.path().join("recordings"))
        );
        assert_eq!(loaded.config_path().unwrap(), path);
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[capture]\nbackend = \"webcam\"\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }
}
