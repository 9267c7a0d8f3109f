//! Protocol reader task.
//!
//! Reads NDJSON lines from an async byte stream, parses each line into a
//! typed message and forwards it through a tokio [`mpsc`] channel. The same
//! task serves both directions: the scheduler reads [`WorkerResponse`]s from
//! a worker's stdout, the worker reads [`WorkerRequest`]s from its stdin.
//!
//! Malformed lines are logged and skipped; they never terminate the reader.
//!
//! [`WorkerResponse`]: super::WorkerResponse
//! [`WorkerRequest`]: super::WorkerRequest

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::codec::WireCodec;
use crate::{AppError, Result};

/// Why a reader task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The stream reached end of file.
    Eof,
    /// The cancellation token fired.
    Cancelled,
    /// The receiving side of the channel was dropped.
    ReceiverClosed,
    /// Unrecoverable I/O failure on the stream.
    Failed(String),
}

/// Parse one NDJSON line.
///
/// Returns `Ok(None)` for blank lines.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] when the line is not a valid message.
pub fn parse_line<T: DeserializeOwned>(line: &str) -> Result<Option<T>> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| AppError::Protocol(format!("malformed message: {e}")))
}

/// Reader task: decode lines from `source` and forward `wrap(message)`.
///
/// Returns when the stream ends, fails, the channel closes, or `cancel`
/// fires; the [`ReaderExit`] says which.
pub async fn run_reader<R, T, E, F>(
    label: String,
    source: R,
    tx: mpsc::Sender<E>,
    wrap: F,
    cancel: CancellationToken,
) -> ReaderExit
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
    F: Fn(T) -> E,
{
    let mut framed = FramedRead::new(source, WireCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(label, "reader: cancellation received, stopping");
                return ReaderExit::Cancelled;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(label, "reader: EOF detected");
                        return ReaderExit::Eof;
                    }
                    Some(Err(AppError::Protocol(ref msg))) => {
                        warn!(label, error = msg.as_str(), "reader: framing error, skipping");
                    }
                    Some(Err(e)) => {
                        warn!(label, error = %e, "reader: IO error, stopping");
                        return ReaderExit::Failed(e.to_string());
                    }
                    Some(Ok(line)) => match parse_line::<T>(&line) {
                        Ok(Some(message)) => {
                            if tx.send(wrap(message)).await.is_err() {
                                debug!(label, "reader: channel closed, stopping");
                                return ReaderExit::ReceiverClosed;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(label, error = %e, "reader: parse error, skipping line");
                        }
                    },
                }
            }
        }
    }
}
