//! In-process procedure router.
//!
//! Procedures are async closures over the connection context and the raw
//! input. Routers can be nested under a dotted prefix with [`Router::merge`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::warn;

use procmux_protocol::ProcedureKind;

use crate::procedure::{
    ProcedureCall, ProcedureError, ProcedureFuture, ProcedureOutput, ProcedureRegistry,
};
use crate::stream::Observable;

type Handler<C> = Arc<dyn Fn(Arc<C>, Option<Value>) -> ProcedureFuture + Send + Sync>;

struct Procedure<C> {
    kind: ProcedureKind,
    handler: Handler<C>,
}

/// Maps procedure paths to handlers.
pub struct Router<C> {
    procedures: BTreeMap<String, Procedure<C>>,
}

impl<C> Default for Router<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for Router<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.procedures.iter().map(|(path, p)| (path, p.kind)))
            .finish()
    }
}

impl<C> Router<C> {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self {
            procedures: BTreeMap::new(),
        }
    }

    /// Registered paths in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }

    /// Returns the kind registered at `path`.
    pub fn kind_of(&self, path: &str) -> Option<ProcedureKind> {
        self.procedures.get(path).map(|p| p.kind)
    }
}

impl<C: Send + Sync + 'static> Router<C> {
    /// Registers a query.
    pub fn query<F, Fut>(self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<C>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProcedureError>> + Send + 'static,
    {
        self.single(path.into(), ProcedureKind::Query, handler)
    }

    /// Registers a mutation.
    pub fn mutation<F, Fut>(self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<C>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProcedureError>> + Send + 'static,
    {
        self.single(path.into(), ProcedureKind::Mutation, handler)
    }

    /// Registers a subscription returning a stream source.
    pub fn subscription<F, Fut>(self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<C>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Observable>, ProcedureError>> + Send + 'static,
    {
        let handler: Handler<C> = Arc::new(move |ctx, input| {
            handler(ctx, input)
                .map(|result| result.map(ProcedureOutput::Stream))
                .boxed()
        });
        self.insert(path.into(), ProcedureKind::Subscription, handler)
    }

    /// Mounts every procedure of `other` under `prefix.`.
    ///
    /// An empty prefix mounts at the root.
    pub fn merge(mut self, prefix: &str, other: Router<C>) -> Self {
        for (path, procedure) in other.procedures {
            let path = if prefix.is_empty() {
                path
            } else {
                format!("{prefix}.{path}")
            };
            self = self.insert(path, procedure.kind, procedure.handler);
        }
        self
    }

    fn single<F, Fut>(self, path: String, kind: ProcedureKind, handler: F) -> Self
    where
        F: Fn(Arc<C>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProcedureError>> + Send + 'static,
    {
        let handler: Handler<C> = Arc::new(move |ctx, input| {
            handler(ctx, input)
                .map(|result| result.map(ProcedureOutput::Value))
                .boxed()
        });
        self.insert(path, kind, handler)
    }

    fn insert(mut self, path: String, kind: ProcedureKind, handler: Handler<C>) -> Self {
        if self
            .procedures
            .insert(path.clone(), Procedure { kind, handler })
            .is_some()
        {
            warn!(path = %path, "Procedure registered twice, keeping the latest");
        }
        self
    }
}

impl<C: Send + Sync + 'static> ProcedureRegistry<C> for Router<C> {
    fn invoke(&self, call: ProcedureCall, ctx: Arc<C>) -> ProcedureFuture {
        match self.procedures.get(&call.path) {
            Some(procedure) if procedure.kind == call.kind => (procedure.handler)(ctx, call.input),
            _ => {
                let error = ProcedureError::not_found(format!(
                    "No \"{}\"-procedure on path \"{}\"",
                    call.kind, call.path
                ));
                Box::pin(async move { Err(error) })
            }
        }
    }
}
