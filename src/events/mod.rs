//! Event bus
//!
//! An ordered, time-stamped feed of lifecycle and log events. Producers never
//! wait on consumers: the bus is a `tokio::sync::broadcast` channel, so a slow
//! subscriber lags (and is told how many events it missed) instead of applying
//! back-pressure to the controller or the output forwarders.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::session::SessionState;

/// Default number of events buffered for lagging subscribers
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Which output stream of a supervised process a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Machine-readable tag for an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// A start/stop/toggle call was ignored
    CommandRejected { command: String },
    ProcessOutput { pid: u32, stream: OutputStream },
    ProcessExited { pid: u32 },
    TranscodeDegraded,
    SessionFailed { kind: ErrorKind },
    Completed { path: PathBuf },
    /// Foreground/background transitions
    Lifecycle,
    Notice,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<Uuid>,
    pub severity: Severity,
    pub kind: EventKind,
    pub message: String,
}

/// Cloneable publishing handle for the event feed
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event and mirror it to the log.
    ///
    /// Having no subscribers is not an error.
    pub fn emit(
        &self,
        session_id: Option<Uuid>,
        severity: Severity,
        kind: EventKind,
        message: impl Into<String>,
    ) -> u64 {
        let message = message.into();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        match (&kind, severity) {
            (EventKind::ProcessOutput { pid, stream }, _) => {
                debug!(pid, ?stream, session = ?session_id, "{}", message)
            }
            (_, Severity::Debug) => debug!(session = ?session_id, "{}", message),
            (_, Severity::Info) => info!(session = ?session_id, "{}", message),
            (_, Severity::Warning) => warn!(session = ?session_id, "{}", message),
            (_, Severity::Error) => error!(session = ?session_id, "{}", message),
        }

        let _ = self.tx.send(Event {
            seq,
            timestamp: Utc::now(),
            session_id,
            severity,
            kind,
            message,
        });
        seq
    }

    pub fn info(&self, session_id: Option<Uuid>, kind: EventKind, message: impl Into<String>) {
        self.emit(session_id, Severity::Info, kind, message);
    }

    pub fn warn(&self, session_id: Option<Uuid>, kind: EventKind, message: impl Into<String>) {
        self.emit(session_id, Severity::Warning, kind, message);
    }

    pub fn error(&self, session_id: Option<Uuid>, kind: EventKind, message: impl Into<String>) {
        self.emit(session_id, Severity::Error, kind, message);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Drain every event currently buffered in a receiver without waiting
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    use broadcast::error::TryRecvError;

    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_ordered() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.info(None, EventKind::Notice, "one");
        bus.warn(None, EventKind::Notice, "two");
        bus.error(None, EventKind::Notice, "three");

        let events = drain(&mut rx);
        let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(events[1].severity, Severity::Warning);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.info(None, EventKind::Notice, "nobody listening");
        let mut rx = bus.subscribe();
        bus.info(None, EventKind::Notice, "late");
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "late");
    }

    #[test]
    fn test_slow_consumer_never_blocks_producer() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe();

        for i in 0..10 {
            bus.info(None, EventKind::Notice, format!("event {}", i));
        }

        // Only the newest events survive in the ring
        let events = drain(&mut slow);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].message, "event 9");
    }
}
