//! Concurrent output draining.
//!
//! One reader task per stream consumes the child's stdout/stderr
//! byte-by-line so the OS pipe buffer can never fill up and stall the child.
//! Lines go to the supervisor over a channel; a [`OutputKind::Closed`]
//! sentinel marks end-of-stream. A read error is treated the same as
//! end-of-stream — everything read up to that point is already delivered.

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

/// Which of the child's streams a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTag {
    Out,
    Err,
}

impl std::fmt::Display for StreamTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamTag::Out => write!(f, "out"),
            StreamTag::Err => write!(f, "err"),
        }
    }
}

/// One line of child output, or the end of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// A single line, trailing newline stripped. Invalid UTF-8 bytes are
    /// replaced with U+FFFD rather than aborting the read.
    Line(String),
    /// The stream reached end-of-file or a read error.
    Closed,
}

/// Event emitted by a drain reader. Per-stream ordering matches what the
/// child wrote; no ordering is guaranteed between the two streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputEvent {
    pub stream: StreamTag,
    pub kind: OutputKind,
}

/// Spawn a reader that drains `stream` line-by-line into `tx` until
/// end-of-stream or read error, then emits the closing sentinel.
pub fn spawn_reader<R>(
    stream: R,
    tag: StreamTag,
    tx: UnboundedSender<OutputEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf: Vec<u8> = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let event = OutputEvent {
                        stream: tag,
                        kind: OutputKind::Line(decode_line(&buf)),
                    };
                    if tx.send(event).is_err() {
                        // Receiver gone; the run is already being torn down.
                        break;
                    }
                }
                Err(e) => {
                    debug!(stream = %tag, error = %e, "stream read error, treating as closed");
                    break;
                }
            }
        }
        let _ = tx.send(OutputEvent {
            stream: tag,
            kind: OutputKind::Closed,
        });
    })
}

/// Lossy-decode one raw line and strip the line terminator.
fn decode_line(raw: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(raw).into_owned();
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    text
}
