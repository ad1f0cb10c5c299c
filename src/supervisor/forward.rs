//! Line forwarding from child output pipes to the event bus

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::events::{EventBus, EventKind, OutputStream, Severity};

/// Longest line forwarded as-is; the rest of a longer line is dropped
pub const MAX_LINE_BYTES: usize = 4096;

/// Forward `reader` line by line until EOF.
///
/// The pipe is always read to the end, even past oversized lines, so the
/// child never blocks on a full pipe.
pub(super) fn spawn_forwarder<R>(
    reader: R,
    pid: u32,
    stream: OutputStream,
    session_id: Option<Uuid>,
    bus: EventBus,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line: Vec<u8> = Vec::with_capacity(256);
        let mut truncated = false;

        loop {
            let available = match reader.fill_buf().await {
                Ok(buf) => buf,
                Err(e) => {
                    debug!(pid, ?stream, "Output forwarding stopped: {}", e);
                    break;
                }
            };

            if available.is_empty() {
                break;
            }

            let (chunk, consumed, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (&available[..i], i + 1, true),
                None => (available, available.len(), false),
            };

            let room = MAX_LINE_BYTES.saturating_sub(line.len());
            if chunk.len() > room {
                truncated = true;
            }
            line.extend_from_slice(&chunk[..chunk.len().min(room)]);
            reader.consume(consumed);

            if complete {
                publish(&bus, &line, truncated, pid, stream, session_id);
                line.clear();
                truncated = false;
            }
        }

        // Trailing output without a newline
        publish(&bus, &line, truncated, pid, stream, session_id);
    })
}

fn publish(
    bus: &EventBus,
    line: &[u8],
    truncated: bool,
    pid: u32,
    stream: OutputStream,
    session_id: Option<Uuid>,
) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end();
    if text.is_empty() {
        return;
    }

    let message = if truncated {
        format!("{} [truncated]", text)
    } else {
        text.to_string()
    };
    bus.emit(
        session_id,
        Severity::Info,
        EventKind::ProcessOutput { pid, stream },
        message,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain;

    #[tokio::test]
    async fn test_forwards_lines_in_order() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let input: &[u8] = b"first\r\nsecond\n\nthird without newline";

        spawn_forwarder(input, 42, OutputStream::Stderr, None, bus.clone())
            .await
            .unwrap();

        let lines: Vec<_> = drain(&mut rx).into_iter().map(|e| e.message).collect();
        assert_eq!(lines, vec!["first", "second", "third without newline"]);
    }

    #[tokio::test]
    async fn test_long_lines_are_truncated_not_buffered() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let mut input = vec![b'x'; MAX_LINE_BYTES * 3];
        input.extend_from_slice(b"\nnext\n");
        let session = Uuid::new_v4();

        spawn_forwarder(
            std::io::Cursor::new(input),
            7,
            OutputStream::Stdout,
            Some(session),
            bus.clone(),
        )
        .await
        .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events[0].message.ends_with("[truncated]"));
        assert!(events[0].message.len() < MAX_LINE_BYTES + 32);
        assert_eq!(events[1].message, "next");
        assert_eq!(events[1].session_id, Some(session));
        assert_eq!(
            events[1].kind,
            EventKind::ProcessOutput {
                pid: 7,
                stream: OutputStream::Stdout
            }
        );
    }
}
