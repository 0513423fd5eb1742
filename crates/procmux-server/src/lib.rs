//! Per-connection RPC multiplexing and subscription lifecycle.
//!
//! This crate serves a [`ProcedureRegistry`] to many clients:
//! - Sessions that decode request frames and dispatch every item concurrently
//! - Subscriptions with `started`, `data` and `stopped` notifications, bound
//!   to their connection and cancelled when it closes
//! - Unix socket transport with length-prefixed frames
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use procmux_server::{
//!     ProcedureError, Router, RpcHandler, ServerConfig, SocketServer, make_connection_handler,
//!     static_context,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = Router::new().query("ping", |_ctx: Arc<()>, _input| async {
//!         Ok::<_, ProcedureError>(serde_json::json!("pong"))
//!     });
//!     let handler = Arc::new(RpcHandler::new(router, static_context(())));
//!
//!     let server = SocketServer::new(ServerConfig::default()).await?;
//!     server.run(make_connection_handler(handler)).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod context;
pub mod demo;
mod dispatch;
mod error;
pub mod logging;
mod outbox;
mod procedure;
mod registry;
mod router;
mod session;
mod socket;
mod stream;
mod subscription;

pub use config::{ServerConfig, default_socket_path};
pub use context::{ConnectionInfo, ContextFactory, ContextFuture, static_context};
pub use dispatch::{CallScope, Dispatcher};
pub use error::{ServerError, ServerResult};
pub use outbox::Outbox;
pub use procedure::{
    ProcedureCall, ProcedureError, ProcedureFuture, ProcedureOutput, ProcedureRegistry,
    parse_input, to_output,
};
pub use registry::{Registration, SubscriptionRegistry};
pub use router::Router;
pub use session::{ConnectionSession, RpcHandler};
pub use socket::{
    Connection, SocketServer, make_connection_handler, read_frame, serve_connection,
};
pub use stream::{CancelHandle, Observable, Observer, StreamEvent, from_stream};
pub use subscription::Subscription;
