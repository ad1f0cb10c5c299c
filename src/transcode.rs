//! Optional post-processing of finished recordings
//!
//! Converts the raw capture (e.g. an H.264 elementary stream) into a
//! container format with an external tool. Any failure here is degraded:
//! the caller keeps the raw file.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TranscodeConfig;
use crate::error::CaptureError;
use crate::supervisor::{CommandLine, Supervisor, SupervisorError};

#[derive(Debug, Clone)]
pub struct Transcoder {
    supervisor: Supervisor,
    program: String,
    /// Argument template with `{input}`, `{output}` and `{fps}` placeholders
    args: Vec<String>,
    output_extension: String,
    timeout: Option<Duration>,
    remove_source: bool,
}

impl Transcoder {
    pub fn new(
        supervisor: Supervisor,
        program: impl Into<String>,
        args: Vec<String>,
        output_extension: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            program: program.into(),
            args,
            output_extension: output_extension.into(),
            timeout: None,
            remove_source: false,
        }
    }

    /// Build from configuration; `None` when transcoding is disabled
    pub fn from_config(config: &TranscodeConfig, supervisor: Supervisor) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let timeout = (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs));
        Some(
            Self::new(
                supervisor,
                config.program.clone(),
                config.args.clone(),
                config.output_extension.clone(),
            )
            .with_timeout(timeout)
            .with_remove_source(config.remove_source),
        )
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_remove_source(mut self, remove_source: bool) -> Self {
        self.remove_source = remove_source;
        self
    }

    pub fn output_extension(&self) -> &str {
        &self.output_extension
    }

    /// Where the converted file for `input` will be written
    pub fn output_path(&self, input: &Path) -> PathBuf {
        input.with_extension(&self.output_extension)
    }

    fn build_command(&self, input: &Path, output: &Path, fps: u32) -> CommandLine {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        let fps = fps.to_string();
        let args = self.args.iter().map(|arg| {
            arg.replace("{input}", &input)
                .replace("{output}", &output)
                .replace("{fps}", &fps)
        });
        CommandLine::new(self.program.clone()).args(args)
    }

    /// Convert `input`, returning the path of the converted file.
    ///
    /// An existing file at the output path is never replaced. On error the
    /// raw input is left untouched and any partial output this run wrote is
    /// removed.
    pub async fn transcode(
        &self,
        input: &Path,
        fps: u32,
        session_id: Uuid,
    ) -> Result<PathBuf, CaptureError> {
        let output = self.output_path(input);
        if output == input {
            return Err(CaptureError::TranscodeDegraded(format!(
                "output would overwrite the input {:?}",
                input
            )));
        }
        if tokio::fs::symlink_metadata(&output).await.is_ok() {
            return Err(CaptureError::TranscodeDegraded(format!(
                "{:?} already exists",
                output
            )));
        }

        let command = self.build_command(input, &output, fps);
        debug!("Transcoding with {}", command);

        let result = match self.supervisor.run(&command, Some(session_id), self.timeout).await {
            Ok(outcome) if outcome.success() => Ok(()),
            Ok(outcome) => Err(format!("{} ended with {}", self.program, outcome)),
            Err(SupervisorError::Spawn { program, source }) => {
                Err(format!("{} could not be started: {}", program, source))
            }
            Err(e) => Err(e.to_string()),
        };

        let result = match result {
            Ok(()) => match tokio::fs::metadata(&output).await {
                Ok(meta) if meta.len() > 0 => Ok(()),
                Ok(_) => Err(format!("{} produced an empty file", self.program)),
                Err(e) => Err(format!("{} produced no output: {}", self.program, e)),
            },
            Err(e) => Err(e),
        };

        if let Err(message) = result {
            if let Err(e) = tokio::fs::remove_file(&output).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove partial output {:?}: {}", output, e);
                }
            }
            return Err(CaptureError::TranscodeDegraded(message));
        }

        info!("Transcoded {:?} -> {:?}", input, output);

        if self.remove_source {
            if let Err(e) = tokio::fs::remove_file(input).await {
                warn!("Failed to remove raw recording {:?}: {}", input, e);
            }
        }

        Ok(output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::supervisor::StopSignal;

    fn transcoder(script: &str) -> Transcoder {
        let supervisor = Supervisor::new(
            EventBus::new(64),
            StopSignal::Terminate,
            Duration::from_millis(500),
        );
        Transcoder::new(
            supervisor,
            "sh",
            vec![
                "-c".into(),
                script.into(),
                "sh".into(),
                "{input}".into(),
                "{output}".into(),
                "{fps}".into(),
            ],
            "mp4",
        )
    }

    #[tokio::test]
    async fn test_transcode_success() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("1700000000000.h264");
        std::fs::write(&input, b"raw").unwrap();

        let output = transcoder("cat \"$1\" > \"$2\"; printf \"@$3\" >> \"$2\"")
            .transcode(&input, 30, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(output, dir.path().join("1700000000000.mp4"));
        assert_eq!(std::fs::read(&output).unwrap(), b"raw@30");
        assert!(input.exists());
    }

    #[tokio::test]
    async fn test_transcode_removes_source_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("clip.h264");
        std::fs::write(&input, b"raw").unwrap();

        let output = transcoder("cp \"$1\" \"$2\"")
            .with_remove_source(true)
            .transcode(&input, 30, Uuid::new_v4())
            .await
            .unwrap();

        assert!(output.exists());
        assert!(!input.exists());
    }

    #[tokio::test]
    async fn test_transcode_failure_keeps_raw_and_cleans_partial() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("clip.h264");
        std::fs::write(&input, b"raw").unwrap();

        let err = transcoder("printf partial > \"$2\"; exit 1")
            .with_remove_source(true)
            .transcode(&input, 30, Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::TranscodeDegraded(_)));
        assert_eq!(std::fs::read(&input).unwrap(), b"raw");
        assert!(!dir.path().join("clip.mp4").exists());
    }

    #[tokio::test]
    async fn test_existing_output_is_never_touched() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("clip.h264");
        let existing = dir.path().join("clip.mp4");
        std::fs::write(&input, b"raw").unwrap();
        std::fs::write(&existing, b"older recording").unwrap();

        for script in ["cp \"$1\" \"$2\"", "exit 3"] {
            let err = transcoder(script)
                .with_remove_source(true)
                .transcode(&input, 30, Uuid::new_v4())
                .await
                .unwrap_err();
            assert!(matches!(err, CaptureError::TranscodeDegraded(_)));
            assert_eq!(std::fs::read(&existing).unwrap(), b"older recording");
            assert_eq!(std::fs::read(&input).unwrap(), b"raw");
        }
    }

    #[tokio::test]
    async fn test_transcode_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("clip.h264");
        std::fs::write(&input, b"raw").unwrap();

        let err = transcoder("exec sleep 30")
            .with_timeout(Some(Duration::from_millis(200)))
            .transcode(&input, 30, Uuid::new_v4())
            .await
            .unwrap_err();

        match err {
            CaptureError::TranscodeDegraded(msg) => assert!(msg.contains("time limit")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(input.exists());
    }

    #[tokio::test]
    async fn test_missing_tool_is_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("clip.h264");
        std::fs::write(&input, b"raw").unwrap();

        let supervisor = Supervisor::new(
            EventBus::new(16),
            StopSignal::Terminate,
            Duration::from_millis(500),
        );
        let err = Transcoder::new(supervisor, "no-such-transcoder", vec![], "mp4")
            .transcode(&input, 30, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::TranscodeDegraded(_)));
    }
}
