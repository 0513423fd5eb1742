//! Connection sessions.
//!
//! [`RpcHandler`] holds what every connection shares: the procedures, the
//! context factory and the response encoder. [`ConnectionSession`] is the
//! state of one open connection and exposes the host-facing lifecycle:
//! `open`, `on_frame` and `close`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use procmux_protocol::{
    DataTransformer, ErrorShape, IdentityTransformer, Method, ResponseEncoder, ResponseEnvelope,
    decode_requests,
};

use crate::context::{ConnectionInfo, ContextFactory};
use crate::dispatch::{CallScope, Dispatcher};
use crate::error::{ServerError, ServerResult};
use crate::outbox::Outbox;
use crate::procedure::{ProcedureError, ProcedureRegistry};
use crate::registry::SubscriptionRegistry;

/// Shared entry point that opens sessions for new connections.
pub struct RpcHandler<C> {
    dispatcher: Dispatcher<C>,
    context_factory: ContextFactory<C>,
    encoder: ResponseEncoder,
}

impl<C: Send + Sync + 'static> RpcHandler<C> {
    /// Creates a handler with the identity transformer.
    pub fn new(procedures: impl ProcedureRegistry<C>, context_factory: ContextFactory<C>) -> Self {
        Self::with_transformer(procedures, context_factory, Arc::new(IdentityTransformer))
    }

    /// Creates a handler whose payloads pass through `transformer`.
    pub fn with_transformer(
        procedures: impl ProcedureRegistry<C>,
        context_factory: ContextFactory<C>,
        transformer: Arc<dyn DataTransformer>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(Arc::new(procedures), transformer.clone()),
            context_factory,
            encoder: ResponseEncoder::new(transformer),
        }
    }

    /// Creates the outbound queue for a new connection.
    pub fn outbox(&self, max_frame_size: usize) -> (Outbox, mpsc::UnboundedReceiver<Vec<u8>>) {
        Outbox::channel(self.encoder.clone(), max_frame_size)
    }
}

struct SessionInner<C> {
    info: ConnectionInfo,
    dispatcher: Dispatcher<C>,
    scope: CallScope<C>,
}

/// One open connection.
///
/// Cloning is cheap and every clone refers to the same connection.
pub struct ConnectionSession<C> {
    inner: Arc<SessionInner<C>>,
}

impl<C> Clone for ConnectionSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> ConnectionSession<C> {
    /// Opens a session by running the context factory.
    ///
    /// On failure an id-less error envelope is queued, `outbox` is closed and
    /// [`ServerError::ContextCreation`] is returned. No frame can be handled
    /// before this resolves.
    pub async fn open(
        handler: &RpcHandler<C>,
        info: ConnectionInfo,
        outbox: Outbox,
    ) -> ServerResult<Self> {
        let created = AssertUnwindSafe((handler.context_factory)(info.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ProcedureError::from_panic(&*panic)));

        let ctx = match created {
            Ok(ctx) => ctx,
            Err(error) => {
                warn!(
                    connection_id = info.connection_id,
                    error = %error,
                    "Context creation failed"
                );
                outbox.send(&ResponseEnvelope::error(
                    None,
                    ErrorShape::new(error.kind(), error.message()),
                ));
                outbox.close();
                return Err(ServerError::ContextCreation {
                    kind: error.kind(),
                    message: error.message().to_string(),
                });
            }
        };

        debug!(connection_id = info.connection_id, "Session opened");
        Ok(Self {
            inner: Arc::new(SessionInner {
                info,
                dispatcher: handler.dispatcher.clone(),
                scope: CallScope {
                    ctx: Arc::new(ctx),
                    registry: Arc::new(SubscriptionRegistry::new()),
                    outbox,
                },
            }),
        })
    }

    /// Handles one inbound frame without waiting on any procedure.
    ///
    /// Items are taken in order. A stop takes effect immediately and a
    /// subscription claims its id before this returns, so later items and
    /// frames see it. Procedures themselves run on their own tasks.
    pub fn on_frame(&self, raw: &[u8]) {
        let scope = &self.inner.scope;
        if !self.is_open() {
            trace!(connection_id = self.inner.info.connection_id, "Frame after close ignored");
            return;
        }

        let items = match decode_requests(raw) {
            Ok(items) => items,
            Err(error) => {
                debug!(
                    connection_id = self.inner.info.connection_id,
                    error = %error,
                    "Unparsable frame"
                );
                scope.outbox.send(&error.to_response());
                return;
            }
        };

        let dispatcher = &self.inner.dispatcher;
        for item in items {
            let request = match item {
                Ok(request) => request,
                Err(invalid) => {
                    debug!(id = ?invalid.id, error = %invalid.error, "Invalid request");
                    scope.outbox.send(&invalid.into_response());
                    continue;
                }
            };
            match request.method {
                Method::SubscriptionStop => dispatcher.stop(&request, scope),
                Method::Subscription => {
                    let subscription = dispatcher.reserve(&request, scope);
                    let input = request.params.input;
                    let (dispatcher, scope) = (dispatcher.clone(), scope.clone());
                    tokio::spawn(async move {
                        dispatcher.subscribe(subscription, input, &scope).await;
                    });
                }
                Method::Query | Method::Mutation => {
                    let (dispatcher, scope) = (dispatcher.clone(), scope.clone());
                    tokio::spawn(async move { dispatcher.dispatch(request, &scope).await });
                }
            }
        }
    }

    /// Closes the session: no further sends, every subscription cancelled once.
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        let scope = &self.inner.scope;
        scope.outbox.close();
        let subscriptions = scope.registry.drain();
        if subscriptions.is_empty() {
            return;
        }
        info!(
            connection_id = self.inner.info.connection_id,
            count = subscriptions.len(),
            "Cancelling subscriptions on close"
        );
        for subscription in subscriptions {
            subscription.cancel_silently();
        }
    }

    /// Returns false once [`ConnectionSession::close`] has run.
    pub fn is_open(&self) -> bool {
        self.inner.scope.registry.is_open()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.scope.registry.len()
    }

    /// The connection context.
    pub fn context(&self) -> &Arc<C> {
        &self.inner.scope.ctx
    }

    /// What the host reported about this connection.
    pub fn info(&self) -> &ConnectionInfo {
        &self.inner.info
    }
}
