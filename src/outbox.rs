//! The sending half of a node.
//!
//! Handlers never write to the output stream directly. They push envelopes into an [`Outbox`], a cheap cloneable
//! handle over a bounded channel, and a single [`OutboxReceiver`] drains the channel into the output stream.
//! With only one writer, every envelope lands on the stream as one whole line and lines never interleave.
//!
//! When the output stream stalls the channel fills up and [`Outbox::send`] waits. A handler therefore holds its
//! pool slot until its lines are queued, which in turn stops the node reading more input.

use std::io;

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{error, trace};

use crate::{
    codec,
    error::SendError,
    message::{Body, Envelope},
};

/// Creates a new outbox holding at most `capacity` unwritten envelopes, and its receiver.
///
/// # Panics
///
/// Panics if `capacity` is 0.
pub fn outbox(capacity: usize) -> (Outbox, OutboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (Outbox(tx), OutboxReceiver(rx))
}

/// A handle for queueing outgoing envelopes.
#[derive(Clone, Debug)]
pub struct Outbox(mpsc::Sender<Envelope<Body>>);

impl Outbox {
    /// Queues an envelope for writing, waiting for room if the outbox is full.
    ///
    /// Fails only when the receiver has been dropped.
    pub async fn send(&self, envelope: Envelope<Body>) -> Result<(), SendError> {
        self.0
            .send(envelope)
            .await
            .map_err(|mpsc::error::SendError(envelope)| SendError(envelope))
    }

    /// Returns `true` if the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// The receiving half of an [`Outbox`].
#[derive(Debug)]
pub struct OutboxReceiver(mpsc::Receiver<Envelope<Body>>);

impl OutboxReceiver {
    /// Receives the next queued envelope, or `None` once every [`Outbox`] has been dropped and the queue is empty.
    pub async fn recv(&mut self) -> Option<Envelope<Body>> {
        self.0.recv().await
    }

    /// Returns the next queued envelope if one is immediately available.
    pub fn try_recv(&mut self) -> Option<Envelope<Body>> {
        self.0.try_recv().ok()
    }

    /// Writes every queued envelope to `writer`, one line each, until all outboxes are dropped.
    ///
    /// Envelopes that fail to serialize are logged and skipped. An I/O error stops the writer.
    pub async fn write_to<W>(mut self, mut writer: W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(envelope) = self.0.recv().await {
            let line = match codec::encode_line(&envelope) {
                Ok(line) => line,
                Err(err) => {
                    error!(%err, ?envelope, "failed to serialize envelope");
                    continue;
                }
            };
            writer.write_all(&line).await?;
            writer.flush().await?;
            trace!(line = %String::from_utf8_lossy(&line[..line.len() - 1]), "sent");
        }

        writer.shutdown().await
    }
}
