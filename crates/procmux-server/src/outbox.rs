//! Outbound envelope queue for one connection.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{trace, warn};

use procmux_protocol::{ErrorKind, ErrorShape, ResponseEncoder, ResponseEnvelope};

/// Encodes envelopes and queues them for the connection's writer.
///
/// Once closed, every further send is dropped.
#[derive(Clone)]
pub struct Outbox {
    inner: Arc<OutboxInner>,
}

struct OutboxInner {
    encoder: ResponseEncoder,
    max_frame_size: usize,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Outbox {
    /// Creates an outbox and the receiving end drained by the writer.
    pub fn channel(
        encoder: ResponseEncoder,
        max_frame_size: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbox = Self {
            inner: Arc::new(OutboxInner {
                encoder,
                max_frame_size,
                tx: Mutex::new(Some(tx)),
            }),
        };
        (outbox, rx)
    }

    /// Encodes and queues an envelope. Returns false if nothing was queued.
    pub fn send(&self, envelope: &ResponseEnvelope) -> bool {
        let mut bytes = self.inner.encoder.encode(envelope);
        if bytes.len() > self.inner.max_frame_size {
            warn!(
                id = ?envelope.id,
                size = bytes.len(),
                max = self.inner.max_frame_size,
                "Response exceeds frame size"
            );
            let error = ErrorShape::new(
                ErrorKind::PayloadTooLarge,
                format!(
                    "response of {} bytes exceeds the {} byte limit",
                    bytes.len(),
                    self.inner.max_frame_size
                ),
            );
            bytes = self.inner.encoder.encode(
                &ResponseEnvelope::error(envelope.id.clone(), error).with_jsonrpc(envelope.jsonrpc),
            );
        }

        let tx = self.inner.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) if tx.send(bytes).is_ok() => true,
            _ => {
                trace!(id = ?envelope.id, "Dropping response for closed connection");
                false
            }
        }
    }

    /// Stops accepting envelopes. The writer drains what is already queued.
    pub fn close(&self) {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Returns true until [`Outbox::close`] is called or the writer goes away.
    pub fn is_open(&self) -> bool {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("open", &self.is_open())
            .finish()
    }
}
