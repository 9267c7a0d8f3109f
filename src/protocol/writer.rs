//! Protocol writer task.
//!
//! Receives outbound messages from an unbounded [`mpsc`] channel, serialises
//! each to a single JSON line and writes it to the peer. The task exits when
//! the channel closes, `cancel` fires, or a write fails.

use futures_util::SinkExt;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::codec::WireCodec;
use crate::{AppError, Result};

/// Writer task: serialise every received message onto `sink`.
///
/// # Errors
///
/// - [`AppError::Protocol`] if a message cannot be serialised.
/// - [`AppError::Io`] if writing to `sink` fails (e.g. the peer exited).
pub async fn run_writer<W, T>(
    label: String,
    sink: W,
    mut rx: mpsc::UnboundedReceiver<T>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut framed = FramedWrite::new(sink, WireCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(label, "writer: cancellation received, stopping");
                break;
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(label, "writer: channel closed, stopping");
                    break;
                };
                let line = serde_json::to_string(&msg).map_err(|e| {
                    AppError::Protocol(format!("failed to serialise outbound message: {e}"))
                })?;
                framed.send(line).await.map_err(|e| {
                    warn!(label, error = %e, "writer: write failed");
                    e
                })?;
            }
        }
    }

    Ok(())
}
