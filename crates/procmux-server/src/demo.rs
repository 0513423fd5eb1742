//! Demo procedures served by `procmuxd`.
//!
//! - `greet` (query): `{"name"?: string}` to a greeting.
//! - `mirror` (query): echoes a string and publishes it to `listen`.
//! - `signIn` (mutation): `{"username", "password"}` to a session record.
//! - `online` (subscription): announces `{"username"}` to every `online`
//!   subscriber, the caller included, and forwards later announcements.
//! - `listen` (subscription): every value passed to `mirror`.

use std::sync::Arc;

use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use procmux_protocol::ErrorKind;

use crate::context::{ConnectionInfo, ContextFactory, ContextFuture};
use crate::procedure::{ProcedureError, parse_input, to_output};
use crate::router::Router;
use crate::stream::{Observable, from_stream};

const CHANNEL_CAPACITY: usize = 64;

/// Process-wide channels shared by every connection.
#[derive(Debug, Clone)]
pub struct DemoHub {
    presence: broadcast::Sender<Value>,
    mirror: broadcast::Sender<Value>,
}

impl Default for DemoHub {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoHub {
    /// Creates the shared channels.
    pub fn new() -> Self {
        Self {
            presence: broadcast::channel(CHANNEL_CAPACITY).0,
            mirror: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }
}

/// Per-connection context of the demo procedures.
#[derive(Debug, Clone)]
pub struct DemoContext {
    /// Server name reported by `greet`.
    pub name: String,
    /// Connection number.
    pub connection_id: u64,
    hub: DemoHub,
}

/// Context factory binding every connection to `hub`.
pub fn context_factory(hub: DemoHub) -> ContextFactory<DemoContext> {
    Arc::new(move |info: ConnectionInfo| -> ContextFuture<DemoContext> {
        let hub = hub.clone();
        Box::pin(async move {
            Ok(DemoContext {
                name: "procmux".to_string(),
                connection_id: info.connection_id,
                hub,
            })
        })
    })
}

#[derive(Debug, Default, Deserialize)]
struct GreetInput {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignInInput {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInOutput {
    username: String,
    connection_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Presence {
    username: String,
}

/// Builds the demo router.
pub fn router() -> Router<DemoContext> {
    Router::new()
        .query("greet", |ctx: Arc<DemoContext>, input| async move {
            let input: GreetInput = match input {
                Some(raw) => parse_input(Some(raw))?,
                None => GreetInput::default(),
            };
            let name = input.name.as_deref().unwrap_or("stranger");
            Ok::<_, ProcedureError>(Value::String(format!("Hello {name}, from {}", ctx.name)))
        })
        .query("mirror", |ctx: Arc<DemoContext>, input| async move {
            let text: String = parse_input(input)?;
            let value = Value::String(text);
            // No receivers is fine.
            let _ = ctx.hub.mirror.send(value.clone());
            Ok::<_, ProcedureError>(value)
        })
        .mutation("signIn", |ctx: Arc<DemoContext>, input| async move {
            let input: SignInInput = parse_input(input)?;
            if input.password.len() < 8 {
                return Err(ProcedureError::new(
                    ErrorKind::Unauthorized,
                    "password must be at least 8 characters",
                ));
            }
            debug!(username = %input.username, "Signed in");
            to_output(&SignInOutput {
                username: input.username,
                connection_id: ctx.connection_id,
            })
        })
        .subscription("online", |ctx: Arc<DemoContext>, input| async move {
            let presence: Presence = parse_input(input)?;
            let receiver = ctx.hub.presence.subscribe();
            let _ = ctx.hub.presence.send(to_output(&presence)?);
            Ok::<_, ProcedureError>(forward(receiver))
        })
        .subscription("listen", |ctx: Arc<DemoContext>, _input| async move {
            Ok::<_, ProcedureError>(forward(ctx.hub.mirror.subscribe()))
        })
}

/// Streams every value sent on a broadcast channel, skipping over lag.
fn forward(receiver: broadcast::Receiver<Value>) -> Box<dyn Observable> {
    from_stream(stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(value) => return Some((Ok(value), receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Subscriber lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }))
}
