//! External capture tool backend
//!
//! Runs a capture command (libcamera-vid by default) under the supervisor.
//! The argument vector is expanded from a template so every parameter the
//! tool receives is explicit.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use super::backend::{AcquireHandle, BackendKind, BackendSignal, CaptureBackend, StreamConfig};
use crate::error::{AcquisitionCause, CaptureError};
use crate::supervisor::{wait_exit, CommandLine, ProcessHandle, Supervisor, SupervisorError};

/// Placeholders every capture template has to use
const REQUIRED_PLACEHOLDERS: [&str; 4] = ["{output}", "{width}", "{height}", "{fps}"];

#[derive(Debug, Clone)]
pub struct ProcessCaptureSettings {
    pub program: String,
    /// Argument template; see [`ProcessBackend::build_command`]
    pub args: Vec<String>,
    pub output_extension: String,
    /// How long the process must stay alive before capture counts as started
    pub liveness_check: Duration,
    /// Exit codes that count as a clean stop
    pub accept_exit_codes: Vec<i32>,
}

struct ActiveCapture {
    session_id: Uuid,
    handle: ProcessHandle,
    watcher: JoinHandle<()>,
}

pub struct ProcessBackend {
    supervisor: Supervisor,
    settings: ProcessCaptureSettings,
    stream: StreamConfig,
    /// None records until stopped
    duration: Option<Duration>,
    active: Option<ActiveCapture>,
}

impl ProcessBackend {
    pub fn new(
        supervisor: Supervisor,
        settings: ProcessCaptureSettings,
        stream: StreamConfig,
        duration: Option<Duration>,
    ) -> Self {
        Self {
            supervisor,
            settings,
            stream,
            duration,
            active: None,
        }
    }

    /// Expand the argument template for `destination`.
    ///
    /// Recognized placeholders: `{output}`, `{width}`, `{height}`, `{fps}` and
    /// `{duration_ms}` (0 means run until stopped). A template that never
    /// passes the output path or the stream format is rejected, since the
    /// tool would silently fall back to its own defaults.
    pub fn build_command(&self, destination: &Path) -> Result<CommandLine, CaptureError> {
        let joined = self.settings.args.join(" ");
        let missing: Vec<_> = REQUIRED_PLACEHOLDERS
            .iter()
            .filter(|p| !joined.contains(*p))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(CaptureError::acquisition(
                AcquisitionCause::Unsupported,
                format!(
                    "capture arguments for {} do not pass {}",
                    self.settings.program,
                    missing.join(", ")
                ),
            ));
        }

        let output = destination.to_string_lossy();
        let duration_ms = self
            .duration
            .map(|d| d.as_millis().to_string())
            .unwrap_or_else(|| "0".to_string());

        let args = self.settings.args.iter().map(|arg| {
            arg.replace("{output}", &output)
                .replace("{width}", &self.stream.width.to_string())
                .replace("{height}", &self.stream.height.to_string())
                .replace("{fps}", &self.stream.fps.to_string())
                .replace("{duration_ms}", &duration_ms)
        });

        Ok(CommandLine::new(self.settings.program.clone()).args(args))
    }

    fn accepts(&self, code: Option<i32>) -> bool {
        code.map(|c| self.settings.accept_exit_codes.contains(&c))
            .unwrap_or(false)
    }
}

fn classify_spawn_error(err: SupervisorError) -> CaptureError {
    match err {
        SupervisorError::Spawn { program, source } => {
            let cause = match source.kind() {
                std::io::ErrorKind::NotFound => AcquisitionCause::BinaryNotFound,
                std::io::ErrorKind::PermissionDenied => AcquisitionCause::PermissionDenied,
                _ => AcquisitionCause::Other,
            };
            CaptureError::acquisition(cause, format!("{}: {}", program, source))
        }
        other => CaptureError::acquisition(AcquisitionCause::Other, other.to_string()),
    }
}

#[async_trait]
impl CaptureBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    fn output_extension(&self) -> &str {
        &self.settings.output_extension
    }

    fn stream_config(&self) -> StreamConfig {
        self.stream
    }

    async fn acquire(
        &mut self,
        destination: &Path,
        session_id: Uuid,
    ) -> Result<AcquireHandle, CaptureError> {
        if self.active.is_some() {
            return Err(CaptureError::acquisition(
                AcquisitionCause::AlreadyAcquired,
                "a capture process is already running",
            ));
        }

        self.stream.validate()?;
        let command = self.build_command(destination)?;

        let handle = self
            .supervisor
            .spawn(&command, Some(session_id))
            .map_err(classify_spawn_error)?;

        let mut exit = handle.exit_watch();
        if let Ok(outcome) = timeout(self.settings.liveness_check, wait_exit(&mut exit)).await {
            // Collect whatever it printed before the failure is reported
            let _ = self.supervisor.terminate(handle, Duration::ZERO).await;
            return Err(CaptureError::acquisition(
                AcquisitionCause::ExitedEarly,
                format!(
                    "{} exited during startup ({})",
                    self.settings.program, outcome
                ),
            ));
        }

        info!(
            "Capture process {} alive after {:?}, recording to {:?}",
            handle.pid(),
            self.settings.liveness_check,
            destination
        );

        // Report the process ending without being asked to
        let (signal_tx, signal_rx) = oneshot::channel();
        let accept = self.settings.accept_exit_codes.clone();
        let stop_signal = self.supervisor.stop_signal();
        let program = self.settings.program.clone();
        let watcher = tokio::spawn(async move {
            let outcome = wait_exit(&mut exit).await;
            // Same exits finalize treats as a clean stop
            let clean = outcome.code.map_or(false, |c| accept.contains(&c))
                || stop_signal.ended(&outcome);
            let signal = if clean {
                BackendSignal::Ended(format!("{} finished ({})", program, outcome))
            } else {
                BackendSignal::Interrupted(CaptureError::DeviceInterrupted(format!(
                    "{} exited unexpectedly ({})",
                    program, outcome
                )))
            };
            let _ = signal_tx.send(signal);
        });

        self.active = Some(ActiveCapture {
            session_id,
            handle,
            watcher,
        });

        Ok(AcquireHandle::new(session_id, destination.to_path_buf()).with_signals(signal_rx))
    }

    async fn finalize(&mut self, handle: AcquireHandle) -> Result<(), CaptureError> {
        let active = match self.active.take() {
            Some(active) if active.session_id == handle.session_id => active,
            other => {
                self.active = other;
                return Err(CaptureError::FinalizeError(format!(
                    "no capture process for session {}",
                    handle.session_id
                )));
            }
        };
        active.watcher.abort();

        let grace = self.supervisor.grace_period();
        let outcome = self
            .supervisor
            .terminate(active.handle, grace)
            .await
            .map_err(|e| CaptureError::FinalizeError(e.to_string()))?;

        if outcome.forced {
            warn!(
                "{} had to be killed after {:?}; output may be incomplete",
                self.settings.program, grace
            );
            return Ok(());
        }

        if self.accepts(outcome.code) || self.supervisor.stop_signal().ended(&outcome) {
            info!("{} stopped ({})", self.settings.program, outcome);
            Ok(())
        } else {
            Err(CaptureError::FinalizeError(format!(
                "{} ended with {}",
                self.settings.program, outcome
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::supervisor::StopSignal;

    fn settings(program: &str, args: &[&str]) -> ProcessCaptureSettings {
        ProcessCaptureSettings {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            output_extension: "h264".to_string(),
            liveness_check: Duration::from_millis(150),
            accept_exit_codes: vec![0],
        }
    }

    fn backend(program: &str, args: &[&str], duration: Option<Duration>) -> ProcessBackend {
        let supervisor = Supervisor::new(
            EventBus::new(64),
            StopSignal::Terminate,
            Duration::from_secs(2),
        );
        ProcessBackend::new(
            supervisor,
            settings(program, args),
            StreamConfig::new(1280, 720, 30),
            duration,
        )
    }

    #[test]
    fn test_build_command_expands_template() {
        let backend = backend(
            "libcamera-vid",
            &[
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
            ],
            None,
        );

        let cmd = backend
            .build_command(Path::new("/data/rec/1700000000000.h264"))
            .unwrap();
        assert_eq!(cmd.program, "libcamera-vid");
        assert_eq!(
            cmd.args,
            vec![
                "--nopreview",
                "-t",
                "0",
                "--width",
                "1280",
                "--height",
                "720",
                "--framerate",
                "30",
                "-o",
                "/data/rec/1700000000000.h264",
            ]
        );
    }

    #[test]
    fn test_build_command_with_duration() {
        let backend = backend(
            "cap",
            &["-o", "{output}", "{width}x{height}", "{fps}", "-t", "{duration_ms}"],
            Some(Duration::from_secs(5)),
        );
        let cmd = backend.build_command(Path::new("/tmp/out.h264")).unwrap();
        assert_eq!(cmd.args[2], "1280x720");
        assert_eq!(cmd.args[5], "5000");
    }

    #[test]
    fn test_template_without_resolution_is_rejected() {
        let backend = backend("cap", &["-o", "{output}", "--framerate", "{fps}"], None);
        let err = backend.build_command(Path::new("/tmp/out.h264")).unwrap_err();
        match err {
            CaptureError::AcquisitionFailed { cause, message } => {
                assert_eq!(cause, AcquisitionCause::Unsupported);
                assert!(message.contains("{width}"));
                assert!(message.contains("{height}"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_binary_is_classified() {
        let mut backend = backend(
            "definitely-not-a-capture-tool",
            &["{output}", "{width}", "{height}", "{fps}"],
            None,
        );
        let dir = tempfile::tempdir().unwrap();
        let err = backend
            .acquire(&dir.path().join("x.h264"), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::AcquisitionFailed {
                cause: AcquisitionCause::BinaryNotFound,
                ..
            }
        ));
        assert!(!dir.path().join("x.h264").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exiting_during_liveness_check() {
        let mut backend = backend(
            "sh",
            &["-c", "echo 'camera not detected' >&2; exit 1", "{output}", "{width}", "{height}", "{fps}"],
            None,
        );
        let dir = tempfile::tempdir().unwrap();
        let err = backend
            .acquire(&dir.path().join("x.h264"), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::AcquisitionFailed {
                cause: AcquisitionCause::ExitedEarly,
                ..
            }
        ));
        assert!(backend.active.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_acquire_and_finalize() {
        let mut backend = backend(
            "sh",
            &[
                "-c",
                "printf 'frames' > \"$1\"; exec sleep 30",
                "sh",
                "{output}",
                "{width}",
                "{height}",
                "{fps}",
            ],
            None,
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.h264");
        let session = Uuid::new_v4();

        let handle = backend.acquire(&path, session).await.unwrap();
        assert_eq!(handle.destination, path);

        let second = backend.acquire(&path, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            second,
            CaptureError::AcquisitionFailed {
                cause: AcquisitionCause::AlreadyAcquired,
                ..
            }
        ));

        backend.finalize(handle).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"frames");
        assert!(backend.active.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_stop_signal_is_a_clean_end() {
        let mut backend = backend(
            "sh",
            &["-c", "exec sleep 30", "sh", "{output}", "{width}", "{height}", "{fps}"],
            None,
        );
        let dir = tempfile::tempdir().unwrap();
        let mut handle = backend
            .acquire(&dir.path().join("x.h264"), Uuid::new_v4())
            .await
            .unwrap();

        let pid = backend.active.as_ref().unwrap().handle.pid();
        unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };

        let signal = handle.take_signals().unwrap().await.unwrap();
        assert!(matches!(signal, BackendSignal::Ended(_)), "{signal:?}");
        backend.finalize(handle).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unexpected_exit_is_signalled() {
        let mut backend = backend(
            "sh",
            &["-c", "sleep 0.4; exit 7", "sh", "{output}", "{width}", "{height}", "{fps}"],
            None,
        );
        let dir = tempfile::tempdir().unwrap();
        let mut handle = backend
            .acquire(&dir.path().join("x.h264"), Uuid::new_v4())
            .await
            .unwrap();

        let signal = handle.take_signals().unwrap().await.unwrap();
        match signal {
            BackendSignal::Interrupted(CaptureError::DeviceInterrupted(msg)) => {
                assert!(msg.contains("exit code 7"))
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }
}
