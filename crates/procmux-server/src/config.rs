//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use procmux_protocol::MAX_MESSAGE_SIZE;

use crate::error::{ServerError, ServerResult};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the Unix socket.
    pub socket_path: PathBuf,

    /// Time allowed for writing one frame to a client.
    pub write_timeout: Duration,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Whether to remove stale socket on startup.
    pub cleanup_stale_socket: bool,

    /// Largest frame payload accepted or sent, in bytes.
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            write_timeout: Duration::from_secs(10),
            max_connections: 100,
            cleanup_stale_socket: true,
            max_frame_size: MAX_MESSAGE_SIZE as usize,
        }
    }
}

impl ServerConfig {
    /// Creates a new server configuration with the given socket path.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    /// Builder: set write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set cleanup stale socket.
    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }

    /// Builder: set max frame size.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Checks limits before the server binds.
    pub fn validate(&self) -> ServerResult<()> {
        if self.max_connections == 0 {
            return Err(ServerError::config("max_connections must be at least 1"));
        }
        if self.max_frame_size == 0 || self.max_frame_size > MAX_MESSAGE_SIZE as usize {
            return Err(ServerError::config(format!(
                "max_frame_size must be between 1 and {MAX_MESSAGE_SIZE}"
            )));
        }
        if self.write_timeout.is_zero() {
            return Err(ServerError::config("write_timeout must be positive"));
        }
        Ok(())
    }

    /// Frame limit as the wire's `u32` length type.
    pub(crate) fn max_frame_len(&self) -> u32 {
        u32::try_from(self.max_frame_size).unwrap_or(MAX_MESSAGE_SIZE)
    }
}

/// Returns the default socket path.
///
/// Uses `$XDG_RUNTIME_DIR/procmux.sock` if available,
/// otherwise falls back to `/tmp/procmux-$UID.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("procmux.sock")
    } else {
        #[cfg(unix)]
        let uid = unsafe { libc::getuid() };
        #[cfg(not(unix))]
        let uid = 0;
        PathBuf::from(format!("/tmp/procmux-{}.sock", uid))
    }
}
