//! Per-connection context creation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::procedure::ProcedureError;

/// What the host knows about a freshly accepted connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Server-assigned connection number, unique per process.
    pub connection_id: u64,
    /// Peer description, when the transport exposes one.
    pub peer: Option<String>,
}

impl ConnectionInfo {
    /// Creates connection info without a peer description.
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            peer: None,
        }
    }

    /// Builder: set the peer description.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }
}

/// Future returned by a [`ContextFactory`].
pub type ContextFuture<C> = Pin<Box<dyn Future<Output = Result<C, ProcedureError>> + Send>>;

/// Builds the opaque context shared by every call on one connection.
///
/// Runs exactly once per connection, before any frame is dispatched.
pub type ContextFactory<C> = Arc<dyn Fn(ConnectionInfo) -> ContextFuture<C> + Send + Sync>;

/// Factory that clones a fixed value for every connection.
pub fn static_context<C>(context: C) -> ContextFactory<C>
where
    C: Clone + Send + Sync + 'static,
{
    Arc::new(move |_info| -> ContextFuture<C> {
        let context = context.clone();
        Box::pin(async move { Ok(context) })
    })
}
