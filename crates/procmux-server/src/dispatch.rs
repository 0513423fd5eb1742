//! Request dispatch.
//!
//! Routes one validated request to the procedure registry and turns the
//! outcome into response envelopes. Query and mutation calls answer exactly
//! once. Subscription calls go through the [`Subscription`] state machine.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, warn};

use procmux_protocol::{DataTransformer, Method, ProcedureKind, RequestEnvelope, ResponseEnvelope};

use crate::outbox::Outbox;
use crate::procedure::{ProcedureCall, ProcedureError, ProcedureOutput, ProcedureRegistry};
use crate::registry::{Registration, SubscriptionRegistry};
use crate::subscription::Subscription;

/// Connection state a dispatched call runs against.
pub struct CallScope<C> {
    /// Connection context.
    pub ctx: Arc<C>,
    /// The connection's subscriptions.
    pub registry: Arc<SubscriptionRegistry>,
    /// The connection's outbound queue.
    pub outbox: Outbox,
}

impl<C> Clone for CallScope<C> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            registry: self.registry.clone(),
            outbox: self.outbox.clone(),
        }
    }
}

/// Dispatches requests to a procedure registry.
pub struct Dispatcher<C> {
    procedures: Arc<dyn ProcedureRegistry<C>>,
    transformer: Arc<dyn DataTransformer>,
}

impl<C> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            procedures: self.procedures.clone(),
            transformer: self.transformer.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> Dispatcher<C> {
    /// Creates a dispatcher. `transformer` decodes every procedure input.
    pub fn new(
        procedures: Arc<dyn ProcedureRegistry<C>>,
        transformer: Arc<dyn DataTransformer>,
    ) -> Self {
        Self {
            procedures,
            transformer,
        }
    }

    /// Handles one request, sending its responses through `scope.outbox`.
    ///
    /// Resolves once a query or mutation has answered, or once a
    /// subscription has started or been rejected.
    #[tracing::instrument(
        skip_all,
        fields(id = %request.id, method = %request.method, path = %request.params.path)
    )]
    pub async fn dispatch(&self, request: RequestEnvelope, scope: &CallScope<C>) {
        match request.method {
            Method::SubscriptionStop => self.stop(&request, scope),
            Method::Subscription => {
                let subscription = self.reserve(&request, scope);
                self.subscribe(subscription, request.params.input, scope)
                    .await;
            }
            Method::Query | Method::Mutation => self.call_once(request, scope).await,
        }
    }

    /// Stops the subscription started under the request's id, if any.
    pub fn stop(&self, request: &RequestEnvelope, scope: &CallScope<C>) {
        match scope.registry.remove(&request.id) {
            Some(subscription) => {
                debug!(id = %request.id, "Stopping subscription");
                subscription.stop();
            }
            None => debug!(id = %request.id, "Stop for unknown subscription ignored"),
        }
    }

    /// Claims the id of a subscription request without running anything.
    ///
    /// A duplicate id is answered with BAD_REQUEST right away; the returned
    /// subscription is then already stopped.
    pub fn reserve(&self, request: &RequestEnvelope, scope: &CallScope<C>) -> Arc<Subscription> {
        let subscription = Subscription::new(
            request.id.clone(),
            request.jsonrpc,
            request.params.path.clone(),
            scope.outbox.clone(),
            &scope.registry,
        );
        match subscription.reserve() {
            Registration::Registered => {}
            Registration::Duplicate => {
                debug!(id = %request.id, "Rejecting subscription with an id already in use");
                subscription.activate();
            }
            Registration::Closed => {
                debug!(id = %request.id, "Connection closed before subscription started");
            }
        }
        subscription
    }

    /// Runs the procedure of a reserved subscription and starts its source.
    ///
    /// Does nothing if the subscription was stopped in the meantime.
    #[tracing::instrument(skip_all, fields(id = %subscription.id(), path = %subscription.path()))]
    pub async fn subscribe(
        &self,
        subscription: Arc<Subscription>,
        input: Option<serde_json::Value>,
        scope: &CallScope<C>,
    ) {
        if subscription.is_stopped() {
            return;
        }
        let path = subscription.path().to_string();

        let observable = match self
            .invoke(ProcedureKind::Subscription, &path, input, scope)
            .await
        {
            Ok(ProcedureOutput::Stream(observable)) => observable,
            Ok(ProcedureOutput::Value(_)) => {
                return subscription.fail(ProcedureError::internal(format!(
                    "Subscription {path} did not return an observable stream"
                )));
            }
            Err(error) => {
                debug!(error = %error, "Subscription procedure failed");
                return subscription.fail(error);
            }
        };

        if subscription.is_stopped() {
            debug!("Subscription stopped before its source started");
            return;
        }
        let observer = subscription.observer();
        let handle =
            match std::panic::catch_unwind(AssertUnwindSafe(|| observable.subscribe(observer))) {
                Ok(handle) => handle,
                Err(panic) => {
                    warn!("Stream source panicked on subscribe");
                    return subscription.fail(ProcedureError::from_panic(&*panic));
                }
            };
        subscription.set_cancel(handle);

        subscription.activate();
    }

    async fn invoke(
        &self,
        kind: ProcedureKind,
        path: &str,
        input: Option<serde_json::Value>,
        scope: &CallScope<C>,
    ) -> Result<ProcedureOutput, ProcedureError> {
        let input = match input {
            Some(raw) => Some(
                self.transformer
                    .deserialize(raw)
                    .map_err(|e| ProcedureError::bad_request(e.to_string()))?,
            ),
            None => None,
        };

        let call = ProcedureCall {
            path: path.to_string(),
            kind,
            input,
        };
        let procedures = &self.procedures;
        let ctx = scope.ctx.clone();
        let run = async move { procedures.invoke(call, ctx).await };
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                warn!(path = %path, "Procedure panicked");
                Err(ProcedureError::from_panic(&*panic))
            }
        }
    }
}
