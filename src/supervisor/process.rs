//! Spawn, reap and terminate supervised processes

use futures::future::join_all;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::forward::spawn_forwarder;
use super::{CommandLine, ExitOutcome, StopSignal, SupervisorError};
use crate::events::{EventBus, EventKind, OutputStream};

/// How long to wait for a killed process to be reaped
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for forwarders to flush after exit.
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle to one supervised process invocation.
///
/// Dropping the handle while the process is alive kills it; the reaper task
/// still collects the exit status, so no zombie is left behind.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    command: CommandLine,
    session_id: Option<Uuid>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    kill_tx: mpsc::Sender<()>,
    forwarders: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    /// Exit outcome if the process has already been reaped
    pub fn try_outcome(&self) -> Option<ExitOutcome> {
        *self.exit_rx.borrow()
    }

    /// A receiver that resolves once the process has been reaped
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitOutcome>> {
        self.exit_rx.clone()
    }
}

/// Wait until the reaper publishes an outcome
pub(crate) async fn wait_exit(rx: &mut watch::Receiver<Option<ExitOutcome>>) -> ExitOutcome {
    let waited = rx.wait_for(Option::is_some).await.map(|outcome| *outcome);
    match waited {
        Ok(outcome) => outcome.unwrap_or(ExitOutcome::UNKNOWN),
        // Reaper gone without publishing
        Err(_) => (*rx.borrow()).unwrap_or(ExitOutcome::UNKNOWN),
    }
}

/// Spawns and supervises external processes
#[derive(Debug, Clone)]
pub struct Supervisor {
    bus: EventBus,
    stop_signal: StopSignal,
    grace_period: Duration,
}

impl Supervisor {
    pub fn new(bus: EventBus, stop_signal: StopSignal, grace_period: Duration) -> Self {
        Self {
            bus,
            stop_signal,
            grace_period,
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop_signal
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Start `command` and begin forwarding its output.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        &self,
        command: &CommandLine,
        session_id: Option<Uuid>,
    ) -> Result<ProcessHandle, SupervisorError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group: a Ctrl+C in our terminal must not reach the
        // child, only the stop signal we send
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        info!("Spawned {} (pid {})", command, pid);

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(spawn_forwarder(
                stdout,
                pid,
                OutputStream::Stdout,
                session_id,
                self.bus.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(spawn_forwarder(
                stderr,
                pid,
                OutputStream::Stderr,
                session_id,
                self.bus.clone(),
            ));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        tokio::spawn(reap(
            child,
            pid,
            command.program.clone(),
            kill_rx,
            exit_tx,
            self.bus.clone(),
            session_id,
        ));

        Ok(ProcessHandle {
            pid,
            command: command.clone(),
            session_id,
            exit_rx,
            kill_tx,
            forwarders,
        })
    }

    /// Ask the process to stop, killing it if it is still alive after `grace`
    pub async fn terminate(
        &self,
        mut handle: ProcessHandle,
        grace: Duration,
    ) -> Result<ExitOutcome, SupervisorError> {
        if let Some(outcome) = handle.try_outcome() {
            debug!("Process {} already exited ({})", handle.pid, outcome);
            self.drain(&mut handle).await;
            return Ok(outcome);
        }

        let outcome = if self.send_stop_signal(&handle) {
            match timeout(grace, wait_exit(&mut handle.exit_rx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.bus.warn(
                        handle.session_id,
                        EventKind::Notice,
                        format!(
                            "{} (pid {}) still running {:?} after {}, killing",
                            handle.command.program, handle.pid, grace, self.stop_signal
                        ),
                    );
                    self.kill(&mut handle).await?
                }
            }
        } else {
            self.kill(&mut handle).await?
        };

        self.drain(&mut handle).await;
        Ok(outcome)
    }

    /// Run `command` to completion, forwarding its output.
    ///
    /// With a `limit`, a process still running when it elapses is terminated
    /// and [`SupervisorError::TimedOut`] is returned.
    pub async fn run(
        &self,
        command: &CommandLine,
        session_id: Option<Uuid>,
        limit: Option<Duration>,
    ) -> Result<ExitOutcome, SupervisorError> {
        let mut handle = self.spawn(command, session_id)?;

        let outcome = match limit {
            None => wait_exit(&mut handle.exit_rx).await,
            Some(limit) => match timeout(limit, wait_exit(&mut handle.exit_rx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let pid = handle.pid;
                    let outcome = self.terminate(handle, self.grace_period).await?;
                    return Err(SupervisorError::TimedOut {
                        pid,
                        limit,
                        outcome,
                    });
                }
            },
        };

        self.drain(&mut handle).await;
        Ok(outcome)
    }

    async fn kill(&self, handle: &mut ProcessHandle) -> Result<ExitOutcome, SupervisorError> {
        let _ = handle.kill_tx.try_send(());
        match timeout(KILL_TIMEOUT, wait_exit(&mut handle.exit_rx)).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Err(SupervisorError::Unkillable { pid: handle.pid }),
        }
    }

    /// Deliver the graceful stop signal. Returns false when there is no way to
    /// ask nicely on this platform.
    fn send_stop_signal(&self, handle: &ProcessHandle) -> bool {
        #[cfg(unix)]
        {
            // The reaper has not collected the child yet, so the pid is still ours
            let rc = unsafe { libc::kill(handle.pid as libc::pid_t, self.stop_signal.as_raw()) };
            if rc != 0 {
                debug!(
                    "Sending {} to pid {} failed: {}",
                    self.stop_signal,
                    handle.pid,
                    std::io::Error::last_os_error()
                );
            } else {
                debug!("Sent {} to pid {}", self.stop_signal, handle.pid);
            }
            true
        }

        #[cfg(not(unix))]
        {
            warn!(
                "No graceful stop signal on this platform, killing pid {}",
                handle.pid
            );
            false
        }
    }

    /// Let forwarders flush what the process wrote before exiting
    async fn drain(&self, handle: &mut ProcessHandle) {
        let forwarders: Vec<_> = handle.forwarders.drain(..).collect();
        if forwarders.is_empty() {
            return;
        }

        let aborts: Vec<_> = forwarders.iter().map(|f| f.abort_handle()).collect();
        if timeout(DRAIN_TIMEOUT, join_all(forwarders)).await.is_err() {
            warn!(
                "Output of pid {} still open after exit, dropping the rest",
                handle.pid
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

/// Own the child until it exits, honoring kill requests.
///
/// A closed kill channel means the handle was dropped, which is treated as a
/// kill request.
async fn reap(
    mut child: Child,
    pid: u32,
    program: String,
    mut kill_rx: mpsc::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
    bus: EventBus,
    session_id: Option<Uuid>,
) {
    let mut forced = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = kill_rx.recv(), if !forced => {
                if request.is_none() {
                    debug!("Handle for pid {} dropped, killing", pid);
                }
                if let Err(e) = child.start_kill() {
                    debug!("Kill of pid {} failed: {}", pid, e);
                }
                forced = true;
            }
        }
    };

    let outcome = match status {
        Ok(status) => ExitOutcome::from_status(status, forced),
        Err(e) => {
            warn!("Failed to collect exit status of pid {}: {}", pid, e);
            ExitOutcome {
                forced,
                ..ExitOutcome::UNKNOWN
            }
        }
    };

    bus.info(
        session_id,
        EventKind::ProcessExited { pid },
        format!("{} (pid {}) exited: {}", program, pid, outcome),
    );
    exit_tx.send_replace(Some(outcome));
}
