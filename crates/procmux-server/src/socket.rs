//! Unix socket transport.
//!
//! Every accepted socket carries length-prefixed JSON frames and drives one
//! [`ConnectionSession`]. A dedicated writer task drains the session's
//! outbox so that each envelope is written as one complete frame.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use procmux_protocol::{
    ErrorKind, ErrorShape, ProtocolError, ResponseEnvelope, encode_frame, frame_len,
};

use crate::config::ServerConfig;
use crate::context::ConnectionInfo;
use crate::error::{ServerError, ServerResult};
use crate::session::{ConnectionSession, RpcHandler};

/// Unix socket server for handling client connections.
pub struct SocketServer {
    /// Server configuration.
    config: ServerConfig,
    /// Unix socket listener.
    listener: UnixListener,
    /// Semaphore for limiting concurrent connections.
    connection_semaphore: Arc<Semaphore>,
    /// Source of connection ids.
    next_connection_id: AtomicU64,
}

impl SocketServer {
    /// Creates a new socket server with the given configuration.
    ///
    /// This will bind to the socket path specified in the configuration.
    /// If `cleanup_stale_socket` is true, a leftover socket file that nobody
    /// answers on is removed before binding.
    pub async fn new(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;
        let socket_path = &config.socket_path;

        if let Some(parent) = socket_path.parent()
            && !parent.exists()
        {
            return Err(ServerError::socket_path_invalid(
                parent.to_string_lossy().to_string(),
            ));
        }

        if config.cleanup_stale_socket && socket_path.exists() {
            match UnixStream::connect(socket_path).await {
                Ok(_) => {
                    return Err(ServerError::socket_in_use(
                        socket_path.to_string_lossy().to_string(),
                    ));
                }
                Err(_) => {
                    info!(
                        path = %socket_path.display(),
                        "Removing stale socket"
                    );
                    std::fs::remove_file(socket_path)?;
                }
            }
        } else if socket_path.exists() {
            return Err(ServerError::socket_in_use(
                socket_path.to_string_lossy().to_string(),
            ));
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(
            path = %socket_path.display(),
            max_connections = config.max_connections,
            "Socket server listening"
        );

        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));

        Ok(Self {
            config,
            listener,
            connection_semaphore,
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Accepts a single connection, waiting for a free slot first.
    pub async fn accept(&self) -> ServerResult<Connection> {
        let permit = self
            .connection_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| std::io::Error::other("connection limiter closed"))?;

        let (stream, _addr) = self.listener.accept().await?;
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = id, "Accepted new connection");

        Ok(Connection {
            id,
            stream,
            write_timeout: self.config.write_timeout,
            max_frame_size: self.config.max_frame_len(),
            _permit: permit,
        })
    }

    /// Runs the server accept loop, calling the handler for each connection.
    ///
    /// This method runs indefinitely until the server is stopped.
    pub async fn run<F, Fut>(&self, handler: F) -> ServerResult<()>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.accept().await {
                Ok(connection) => {
                    tokio::spawn(handler(connection));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Runs the server accept loop with a shutdown signal.
    ///
    /// The server will stop when the shutdown future completes.
    pub async fn run_until_shutdown<F, Fut, S>(&self, handler: F, shutdown: S) -> ServerResult<()>
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        S: Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run(handler) => result,
            _ = shutdown => {
                info!("Shutdown signal received");
                Ok(())
            }
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        if self.config.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
                warn!(
                    path = %self.config.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            } else {
                debug!(
                    path = %self.config.socket_path.display(),
                    "Removed socket file"
                );
            }
        }
    }
}

/// A client connection to the server.
pub struct Connection {
    id: u64,
    stream: UnixStream,
    write_timeout: Duration,
    max_frame_size: u32,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    /// Server-assigned connection number.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Reads one frame payload.
///
/// Returns `Ok(None)` if the peer closed the stream before a new frame began.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: u32) -> ServerResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = frame_len(header, max_frame_size)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Drives one connection until the peer disconnects.
///
/// The session is closed on every exit path, which cancels all of its
/// subscriptions.
pub async fn serve_connection<C>(conn: Connection, handler: Arc<RpcHandler<C>>) -> ServerResult<()>
where
    C: Send + Sync + 'static,
{
    let Connection {
        id,
        stream,
        write_timeout,
        max_frame_size,
        _permit,
    } = conn;
    let (mut reader, writer) = stream.into_split();
    let (outbox, rx) = handler.outbox(max_frame_size as usize);
    let writer_task = tokio::spawn(write_frames(id, writer, rx, write_timeout));

    let info = ConnectionInfo::new(id).with_peer("unix");
    let session = match ConnectionSession::open(&handler, info, outbox.clone()).await {
        Ok(session) => session,
        Err(e) => {
            let _ = writer_task.await;
            return Err(e);
        }
    };

    let result = loop {
        match read_frame(&mut reader, max_frame_size).await {
            Ok(Some(payload)) => session.on_frame(&payload),
            Ok(None) => {
                debug!(connection_id = id, "Client disconnected");
                break Ok(());
            }
            Err(ServerError::Protocol(ProtocolError::MessageTooLarge { size, max })) => {
                warn!(connection_id = id, size, max, "Frame too large, closing connection");
                outbox.send(&ResponseEnvelope::error(
                    None,
                    ErrorShape::new(
                        ErrorKind::PayloadTooLarge,
                        format!("frame of {size} bytes exceeds the {max} byte limit"),
                    ),
                ));
                break Err(ProtocolError::MessageTooLarge { size, max }.into());
            }
            Err(ServerError::Protocol(ProtocolError::EmptyMessage)) => {
                warn!(connection_id = id, "Empty frame, closing connection");
                outbox.send(&ResponseEnvelope::error(
                    None,
                    ErrorShape::new(ErrorKind::BadRequest, "empty frame"),
                ));
                break Err(ProtocolError::EmptyMessage.into());
            }
            Err(e) => {
                warn!(connection_id = id, error = %e, "Error reading frame");
                break Err(e);
            }
        }
    };

    session.close();
    drop(outbox);
    let _ = writer_task.await;
    result
}

async fn write_frames(
    connection_id: u64,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    write_timeout: Duration,
) {
    while let Some(payload) = rx.recv().await {
        let frame = match encode_frame(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection_id, error = %e, "Dropping unframeable response");
                continue;
            }
        };
        match tokio::time::timeout(write_timeout, writer.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection_id, error = %e, "Write failed");
                break;
            }
            Err(_) => {
                let e = ProtocolError::timeout("frame write");
                warn!(connection_id, error = %e, "Giving up on connection");
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Creates a connection handler for [`SocketServer::run`].
pub fn make_connection_handler<C>(
    handler: Arc<RpcHandler<C>>,
) -> impl Fn(Connection) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static
where
    C: Send + Sync + 'static,
{
    move |conn| {
        let handler = handler.clone();
        Box::pin(async move {
            let id = conn.id();
            if let Err(e) = serve_connection(conn, handler).await {
                warn!(connection_id = id, error = %e, "Connection handler error");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextFactory, ContextFuture, static_context};
    use crate::procedure::{ProcedureError, parse_input};
    use crate::router::Router;
    use crate::stream::from_stream;
    use futures_util::stream;
    use serde_json::{Value, json};
    use tempfile::tempdir;

    fn test_handler() -> Arc<RpcHandler<()>> {
        let router = Router::new()
            .query("greet", |_ctx, input| async move {
                let name: String = parse_input(input)?;
                Ok::<_, ProcedureError>(json!(format!("hello {name}")))
            })
            .subscription("pending", |_ctx, _input| async {
                Ok(from_stream(stream::pending()))
            })
            .subscription("slowStart", |_ctx, _input| async {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                Ok(from_stream(stream::pending()))
            });
        Arc::new(RpcHandler::new(router, static_context(())))
    }

    async fn write_json(stream: &mut UnixStream, value: Value) {
        let frame = encode_frame(value.to_string().as_bytes()).unwrap();
        stream.write_all(&frame).await.unwrap();
    }

    async fn read_json(stream: &mut UnixStream) -> Value {
        let payload = read_frame(stream, procmux_protocol::MAX_MESSAGE_SIZE)
            .await
            .unwrap()
            .unwrap();
        serde_json::from_slice(&payload).unwrap()
    }

    #[tokio::test]
    async fn socket_server_creates_socket_file() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let server = SocketServer::new(ServerConfig::new(&socket_path))
            .await
            .unwrap();

        assert!(socket_path.exists());
        assert_eq!(server.socket_path(), socket_path);
        drop(server);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn socket_server_rejects_duplicate() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let config = ServerConfig::new(&socket_path).with_cleanup_stale_socket(false);
        let _server = SocketServer::new(config.clone()).await.unwrap();

        let result = SocketServer::new(config).await;
        assert!(matches!(result, Err(ServerError::SocketInUse { .. })));
    }

    #[tokio::test]
    async fn socket_server_cleans_stale_socket() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let config = ServerConfig::new(&socket_path).with_cleanup_stale_socket(true);
        let server = SocketServer::new(config).await.unwrap();

        assert!(socket_path.exists());
        drop(server);
    }

    #[tokio::test]
    async fn socket_server_rejects_missing_parent() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("missing").join("test.sock");

        let result = SocketServer::new(ServerConfig::new(&socket_path)).await;
        assert!(matches!(result, Err(ServerError::SocketPathInvalid { .. })));
    }

    #[tokio::test]
    async fn read_frame_handles_eof_and_limits() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty, 16).await.unwrap().is_none());

        let mut oversized: &[u8] = &[0, 0, 1, 0];
        assert!(matches!(
            read_frame(&mut oversized, 16).await,
            Err(ServerError::Protocol(ProtocolError::MessageTooLarge { size: 256, max: 16 }))
        ));

        let mut framed: &[u8] = &[0, 0, 0, 2, b'[', b']'];
        assert_eq!(read_frame(&mut framed, 16).await.unwrap().unwrap(), b"[]");
    }

    #[tokio::test]
    async fn connection_roundtrip() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let server = SocketServer::new(ServerConfig::new(&socket_path))
            .await
            .unwrap();

        let handler = test_handler();
        let server_task = tokio::spawn(async move {
            let conn = server.accept().await.unwrap();
            serve_connection(conn, handler).await
        });

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        write_json(
            &mut client,
            json!({"id": 1, "method": "query", "params": {"path": "greet", "input": "unix"}}),
        )
        .await;
        assert_eq!(
            read_json(&mut client).await,
            json!({"id": 1, "result": {"type": "data", "data": "hello unix"}})
        );

        write_json(
            &mut client,
            json!({"id": 2, "method": "subscription", "params": {"path": "pending"}}),
        )
        .await;
        assert_eq!(
            read_json(&mut client).await,
            json!({"id": 2, "result": {"type": "started"}})
        );

        client.write_all(&encode_frame(b"garbage").unwrap()).await.unwrap();
        let response = read_json(&mut client).await;
        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["error"]["data"]["kind"], json!("PARSE_ERROR"));

        drop(client);
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let config = ServerConfig::new(&socket_path).with_max_frame_size(256);
        let server = SocketServer::new(config).await.unwrap();

        let handler = test_handler();
        let server_task = tokio::spawn(async move {
            let conn = server.accept().await.unwrap();
            serve_connection(conn, handler).await
        });

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        client.write_all(&1024u32.to_be_bytes()).await.unwrap();

        let response = read_json(&mut client).await;
        assert_eq!(response["error"]["data"]["kind"], json!("PAYLOAD_TOO_LARGE"));
        assert!(read_frame(&mut client, 1024).await.unwrap().is_none());

        let result = server_task.await.unwrap();
        assert!(matches!(
            result,
            Err(ServerError::Protocol(ProtocolError::MessageTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn empty_frame_is_bad_request_and_closes() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let server = SocketServer::new(ServerConfig::new(&socket_path))
            .await
            .unwrap();

        let handler = test_handler();
        let server_task = tokio::spawn(async move {
            let conn = server.accept().await.unwrap();
            serve_connection(conn, handler).await
        });

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        client.write_all(&[0, 0, 0, 0]).await.unwrap();

        let response = read_json(&mut client).await;
        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["error"]["data"]["kind"], json!("BAD_REQUEST"));
        assert!(read_frame(&mut client, 1024).await.unwrap().is_none());

        assert!(matches!(
            server_task.await.unwrap(),
            Err(ServerError::Protocol(ProtocolError::EmptyMessage))
        ));
    }

    #[tokio::test]
    async fn slow_subscription_does_not_block_reads() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let server = SocketServer::new(ServerConfig::new(&socket_path))
            .await
            .unwrap();

        let handler = test_handler();
        let server_task = tokio::spawn(async move {
            let conn = server.accept().await.unwrap();
            serve_connection(conn, handler).await
        });

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        write_json(
            &mut client,
            json!({"id": 1, "method": "subscription", "params": {"path": "slowStart"}}),
        )
        .await;
        write_json(
            &mut client,
            json!({"id": 2, "method": "query", "params": {"path": "greet", "input": "fast"}}),
        )
        .await;

        assert_eq!(
            read_json(&mut client).await,
            json!({"id": 2, "result": {"type": "data", "data": "hello fast"}})
        );
        assert_eq!(
            read_json(&mut client).await,
            json!({"id": 1, "result": {"type": "started"}})
        );

        drop(client);
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn context_failure_reaches_client() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let server = SocketServer::new(ServerConfig::new(&socket_path))
            .await
            .unwrap();

        let factory: ContextFactory<()> = Arc::new(|_info| -> ContextFuture<()> {
            Box::pin(async { Err(ProcedureError::internal("database unavailable")) })
        });
        let handler = Arc::new(RpcHandler::new(Router::new(), factory));
        let server_task = tokio::spawn(async move {
            let conn = server.accept().await.unwrap();
            serve_connection(conn, handler).await
        });

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        let response = read_json(&mut client).await;
        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["error"]["message"], json!("database unavailable"));
        assert!(read_frame(&mut client, 1024).await.unwrap().is_none());

        assert!(matches!(
            server_task.await.unwrap(),
            Err(ServerError::ContextCreation { .. })
        ));
    }

    #[tokio::test]
    async fn run_until_shutdown_serves_clients() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");
        let server = SocketServer::new(ServerConfig::new(&socket_path))
            .await
            .unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server_task = tokio::spawn(async move {
            server
                .run_until_shutdown(make_connection_handler(test_handler()), async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        write_json(
            &mut client,
            json!([
                {"id": "a", "method": "query", "params": {"path": "greet", "input": "a"}},
                {"id": "b", "method": "query", "params": {"path": "greet", "input": "b"}}
            ]),
        )
        .await;
        let mut ids = vec![
            read_json(&mut client).await["id"].clone(),
            read_json(&mut client).await["id"].clone(),
        ];
        ids.sort_by_key(|id| id.to_string());
        assert_eq!(ids, vec![json!("a"), json!("b")]);

        stop_tx.send(()).unwrap();
        server_task.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }
}
