//! Session controller
//!
//! Owns at most one non-terminal session and sequences the path resolver,
//! the capture backend and the transcoder for it. Every transition runs
//! under one async mutex, so overlapping `start`/`stop`/`toggle` calls see
//! each other's effects and turn into rejected no-ops instead of racing.
//!
//! Observers read state through the session watch channel and the event bus
//! and never take the mutex, so status queries stay responsive while a stop
//! waits out the grace period.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ControlError, Session, SessionError, SessionState};
use crate::capture::{create_backend, AcquireHandle, BackendKind, BackendSignal, CaptureBackend};
use crate::config::Config;
use crate::error::CaptureError;
use crate::events::{Event, EventBus, EventKind};
use crate::storage::{list_recordings, PathResolver};
use crate::supervisor::Supervisor;
use crate::transcode::Transcoder;

/// Collaborators and policy for a controller
#[derive(Debug)]
pub struct ControllerSettings {
    pub resolver: PathResolver,
    /// Post-processing step; `None` keeps the raw capture
    pub transcoder: Option<Transcoder>,
    /// Keep the raw file of a failed session
    pub keep_partial_on_failure: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            resolver: PathResolver::new(None),
            transcoder: None,
            keep_partial_on_failure: false,
        }
    }
}

/// Drives recording sessions. Cloning yields another handle to the same
/// controller.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

struct Shared {
    bus: EventBus,
    backend_kind: BackendKind,
    settings: ControllerSettings,
    session_tx: watch::Sender<Option<Session>>,
    core: Mutex<Core>,
}

struct Core {
    backend: Box<dyn CaptureBackend>,
    session: Option<Session>,
    active: Option<ActiveRecording>,
}

impl Core {
    fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.id)
    }
}

/// Backend acquisition held while a session records
struct ActiveRecording {
    handle: AcquireHandle,
    /// Listens for backend signals; detached once it starts handling one
    monitor: Option<JoinHandle<()>>,
}

impl ActiveRecording {
    fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

impl SessionController {
    pub fn new(
        backend: Box<dyn CaptureBackend>,
        bus: EventBus,
        settings: ControllerSettings,
    ) -> Self {
        let (session_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                bus,
                backend_kind: backend.kind(),
                settings,
                session_tx,
                core: Mutex::new(Core {
                    backend,
                    session: None,
                    active: None,
                }),
            }),
        }
    }

    /// Build the backend, supervisor and transcoder described by `config`
    pub fn from_config(config: &Config, bus: EventBus) -> Self {
        let supervisor = Supervisor::new(
            bus.clone(),
            config.supervisor.stop_signal,
            config.supervisor.grace_period(),
        );
        let backend = create_backend(config, supervisor.clone());
        let settings = ControllerSettings {
            resolver: PathResolver::new(config.storage.output_directory.clone()),
            transcoder: Transcoder::from_config(&config.transcode, supervisor),
            keep_partial_on_failure: config.storage.keep_partial_on_failure,
        };
        Self::new(backend, bus, settings)
    }

    /// Begin a new session. Rejected while another session is in flight.
    pub async fn start(&self) -> Result<Uuid, ControlError> {
        let mut core = self.shared.core.lock().await;
        self.shared.start_locked(&mut core).await
    }

    /// Stop the recording session and return its final output path
    pub async fn stop(&self) -> Result<PathBuf, ControlError> {
        let mut core = self.shared.core.lock().await;
        self.shared.stop_locked(&mut core, "stop").await
    }

    /// Start when idle, stop when recording. Returns the state reached.
    pub async fn toggle(&self) -> Result<SessionState, ControlError> {
        let mut core = self.shared.core.lock().await;
        match core.state() {
            SessionState::Recording => {
                self.shared.stop_locked(&mut core, "toggle").await?;
            }
            state if state.accepts_start() => {
                self.shared.start_locked(&mut core).await?;
            }
            state => return Err(self.shared.reject(core.session_id(), state, "toggle")),
        }
        Ok(core.state())
    }

    /// The app moved to the background. The backend releases its device and
    /// a session that was recording fails with `DeviceInterrupted`.
    pub async fn enter_background(&self) -> Result<(), CaptureError> {
        let mut core = self.shared.core.lock().await;
        let id = core.session_id();
        self.shared
            .bus
            .info(id, EventKind::Lifecycle, "Entering background");

        if core.state() == SessionState::Recording {
            let err = CaptureError::DeviceInterrupted(
                "app moved to the background while recording".to_string(),
            );
            self.shared.interrupt_locked(&mut core, err).await;
        }

        core.backend.suspend().await
    }

    /// The app returned to the foreground; re-acquire released devices
    pub async fn enter_foreground(&self) -> Result<(), CaptureError> {
        let mut core = self.shared.core.lock().await;
        self.shared
            .bus
            .info(core.session_id(), EventKind::Lifecycle, "Entering foreground");
        core.backend.resume().await
    }

    /// Stop any recording in progress so no capture process outlives us
    pub async fn shutdown(&self) {
        let mut core = self.shared.core.lock().await;
        if core.state() != SessionState::Recording {
            return;
        }
        info!("Shutting down with a recording in progress, stopping it");
        if let Err(e) = self.shared.stop_locked(&mut core, "shutdown").await {
            warn!("Recording did not stop cleanly during shutdown: {}", e);
        }
    }

    pub fn current_state(&self) -> SessionState {
        self.shared
            .session_tx
            .borrow()
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    /// Latest session, in whatever state it is in
    pub fn snapshot(&self) -> Option<Session> {
        self.shared.session_tx.borrow().clone()
    }

    /// Receiver that sees every session update
    pub fn watch_session(&self) -> watch::Receiver<Option<Session>> {
        self.shared.session_tx.subscribe()
    }

    pub fn final_output_path(&self) -> Option<PathBuf> {
        self.shared
            .session_tx
            .borrow()
            .as_ref()
            .and_then(|s| s.final_output_path.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.bus.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.shared.backend_kind
    }

    /// Files in the recordings directory, oldest first
    pub async fn list_recordings(&self) -> Result<Vec<PathBuf>, CaptureError> {
        let root = self.shared.settings.resolver.resolve_root().await?;
        list_recordings(&root)
            .await
            .map_err(|e| CaptureError::storage(&root, e))
    }
}

impl Shared {
    /// Record a transition and tell observers about it
    fn set_state(&self, session: &mut Session, to: SessionState) {
        let from = session.state;
        session.state = to;
        if to.is_terminal() {
            session.ended_at = Some(Utc::now());
        }
        self.session_tx.send_replace(Some(session.clone()));
        self.bus.info(
            Some(session.id),
            EventKind::StateChanged { from, to },
            format!("Session {}: {} -> {}", session.id, from, to),
        );
    }

    fn reject(
        &self,
        session_id: Option<Uuid>,
        state: SessionState,
        command: &'static str,
    ) -> ControlError {
        self.bus.warn(
            session_id,
            EventKind::CommandRejected {
                command: command.to_string(),
            },
            format!("Ignoring {} while {}", command, state),
        );
        ControlError::Rejected { command, state }
    }

    /// Move `session` to Failed, cleaning up its partial output
    async fn fail(&self, session: &mut Session, err: CaptureError) -> ControlError {
        if !self.settings.keep_partial_on_failure {
            if let Some(path) = &session.raw_output_path {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => debug!("Removed partial recording {:?}", path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove partial recording {:?}: {}", path, e),
                }
            }
        }

        session.last_error = Some(SessionError::from(&err));
        self.set_state(session, SessionState::Failed);
        self.bus.error(
            Some(session.id),
            EventKind::SessionFailed { kind: err.kind() },
            format!("Session {} failed: {}", session.id, err),
        );

        ControlError::Failed {
            session_id: session.id,
            source: err,
        }
    }

    async fn start_locked(self: &Arc<Self>, core: &mut Core) -> Result<Uuid, ControlError> {
        let state = core.state();
        if !state.accepts_start() {
            return Err(self.reject(core.session_id(), state, "start"));
        }

        let mut session = Session::new(self.backend_kind);
        let id = session.id;
        self.set_state(&mut session, SessionState::Initializing);
        let session = core.session.insert(session);

        let root = match self.settings.resolver.resolve_root().await {
            Ok(root) => root,
            Err(e) => return Err(self.fail(session, e).await),
        };
        let companions: Vec<&str> = self
            .settings
            .transcoder
            .iter()
            .map(|t| t.output_extension())
            .collect();
        let destination = self.settings.resolver.allocate_output_path_with(
            &root,
            core.backend.output_extension(),
            &companions,
        );
        session.raw_output_path = Some(destination.clone());

        let mut handle = match core.backend.acquire(&destination, id).await {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(session, e).await),
        };

        self.set_state(session, SessionState::Recording);
        info!(
            "Recording session {} to {:?} ({} backend, {})",
            id,
            destination,
            self.backend_kind,
            core.backend.stream_config()
        );

        let monitor = handle
            .take_signals()
            .map(|signals| tokio::spawn(monitor(Arc::clone(self), id, signals)));
        core.active = Some(ActiveRecording { handle, monitor });

        Ok(id)
    }

    async fn stop_locked(
        &self,
        core: &mut Core,
        command: &'static str,
    ) -> Result<PathBuf, ControlError> {
        let state = core.state();
        if state != SessionState::Recording {
            return Err(self.reject(core.session_id(), state, command));
        }
        let Some(mut active) = core.active.take() else {
            return Err(self.reject(core.session_id(), state, command));
        };
        active.stop_monitor();
        let Some(session) = core.session.as_mut() else {
            return Err(self.reject(None, state, command));
        };

        let id = session.id;
        self.set_state(session, SessionState::Stopping);

        if let Err(e) = core.backend.finalize(active.handle).await {
            return Err(self.fail(session, e).await);
        }

        let Some(raw) = session.raw_output_path.clone() else {
            let err = CaptureError::FinalizeError("session has no output path".to_string());
            return Err(self.fail(session, err).await);
        };
        let check = match tokio::fs::metadata(&raw).await {
            Ok(meta) if meta.len() > 0 => Ok(meta.len()),
            Ok(_) => Err(format!("{:?} is empty", raw)),
            Err(e) => Err(format!("{:?} is missing: {}", raw, e)),
        };
        let size = match check {
            Ok(size) => size,
            Err(message) => return Err(self.fail(session, CaptureError::FinalizeError(message)).await),
        };
        debug!("Raw recording {:?} holds {} bytes", raw, size);

        self.set_state(session, SessionState::Finalizing);

        let final_path = match &self.settings.transcoder {
            Some(transcoder) => {
                let fps = core.backend.stream_config().fps;
                match transcoder.transcode(&raw, fps, id).await {
                    Ok(path) => path,
                    Err(e) => {
                        self.bus.warn(
                            Some(id),
                            EventKind::TranscodeDegraded,
                            format!("Keeping raw recording {:?}: {}", raw, e),
                        );
                        raw
                    }
                }
            }
            None => raw,
        };

        session.final_output_path = Some(final_path.clone());
        self.set_state(session, SessionState::Completed);
        self.bus.info(
            Some(id),
            EventKind::Completed {
                path: final_path.clone(),
            },
            format!("Recording saved to {:?}", final_path),
        );

        Ok(final_path)
    }

    /// Fail the recording session, releasing whatever the backend holds
    async fn interrupt_locked(&self, core: &mut Core, err: CaptureError) {
        let Some(session) = core.session.as_mut() else {
            return;
        };

        if let Some(mut active) = core.active.take() {
            active.stop_monitor();
            if let Err(e) = core.backend.finalize(active.handle).await {
                debug!("Releasing interrupted capture: {}", e);
            }
        }

        self.fail(session, err).await;
    }
}

/// Wait for the backend to report on a recording session and react to it
async fn monitor(
    shared: Arc<Shared>,
    session_id: Uuid,
    signals: oneshot::Receiver<BackendSignal>,
) {
    let Ok(signal) = signals.await else {
        return;
    };

    let mut core = shared.core.lock().await;
    if core.session_id() != Some(session_id) || core.state() != SessionState::Recording {
        return;
    }
    // Detach so the stop path does not abort the task running it
    if let Some(active) = core.active.as_mut() {
        active.monitor.take();
    }

    match signal {
        BackendSignal::Ended(message) => {
            shared
                .bus
                .info(Some(session_id), EventKind::Notice, message);
            if let Err(e) = shared.stop_locked(&mut core, "natural end").await {
                warn!("Session {} ended on its own but did not complete: {}", session_id, e);
            }
        }
        BackendSignal::Interrupted(err) => {
            shared.interrupt_locked(&mut core, err).await;
        }
    }
}
