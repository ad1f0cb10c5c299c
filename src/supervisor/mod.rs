//! Subprocess supervision
//!
//! External capture and transcode tools run under a [`Supervisor`]. Each
//! spawned process gets:
//! - a reaper task that owns the child and publishes its exit outcome
//! - one forwarding task per output stream, publishing lines to the event bus
//!
//! The [`ProcessHandle`] returned to callers only holds channels to those
//! tasks, so nothing ever shares the child or its output buffers.

mod forward;
mod process;

pub use process::{ProcessHandle, Supervisor};
pub(crate) use process::wait_exit;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// An external command as an explicit argument vector (never a shell string)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    /// Exit code, absent when the process was ended by a signal
    pub code: Option<i32>,
    /// Terminating signal (unix only)
    pub signal: Option<i32>,
    /// Whether the supervisor had to kill the process
    pub forced: bool,
}

impl ExitOutcome {
    /// Outcome used when the exit status could not be observed
    pub const UNKNOWN: ExitOutcome = ExitOutcome {
        code: None,
        signal: None,
        forced: false,
    };

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub(crate) fn from_status(status: std::process::ExitStatus, forced: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            forced,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code)?,
            (None, Some(signal)) => write!(f, "terminated by signal {}", signal)?,
            (None, None) => write!(f, "unknown exit status")?,
        }
        if self.forced {
            write!(f, " (killed)")?;
        }
        Ok(())
    }
}

/// Signal used to ask a process to finish cleanly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopSignal {
    /// SIGINT, what most capture tools treat as Ctrl+C
    #[default]
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl StopSignal {
    #[cfg(unix)]
    pub fn as_raw(self) -> libc::c_int {
        match self {
            StopSignal::Interrupt => libc::SIGINT,
            StopSignal::Terminate => libc::SIGTERM,
        }
    }

    /// Whether `outcome` is the process dying from this signal
    pub fn ended(self, outcome: &ExitOutcome) -> bool {
        #[cfg(unix)]
        {
            outcome.signal == Some(self.as_raw())
        }
        #[cfg(not(unix))]
        {
            let _ = outcome;
            false
        }
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Interrupt => f.write_str("SIGINT"),
            StopSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process {pid} did not exit after being killed")]
    Unkillable { pid: u32 },

    #[error("process {pid} exceeded its {limit:?} time limit ({outcome})")]
    TimedOut {
        pid: u32,
        limit: Duration,
        outcome: ExitOutcome,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_display_quotes_spaces() {
        let cmd = CommandLine::new("ffmpeg")
            .args(["-i", "/tmp/my clip.h264"])
            .arg("out.mp4");
        assert_eq!(cmd.to_string(), "ffmpeg -i \"/tmp/my clip.h264\" out.mp4");
    }

    #[test]
    fn test_exit_outcome_display() {
        let ok = ExitOutcome {
            code: Some(0),
            signal: None,
            forced: false,
        };
        assert!(ok.success());
        assert_eq!(ok.to_string(), "exit code 0");

        let killed = ExitOutcome {
            code: None,
            signal: Some(9),
            forced: true,
        };
        assert!(!killed.success());
        assert_eq!(killed.to_string(), "terminated by signal 9 (killed)");
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_signal_matches_outcome() {
        let outcome = ExitOutcome {
            code: None,
            signal: Some(libc::SIGINT),
            forced: false,
        };
        assert!(StopSignal::Interrupt.ended(&outcome));
        assert!(!StopSignal::Terminate.ended(&outcome));
    }
}
