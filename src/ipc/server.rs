//! Unix domain socket server for IPC
//!
//! Provides request-response communication and push delivery of detector
//! events to subscribed clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::events::DetectorEvent;

use super::protocol::{DaemonStatus, Notification, Request, Response};

/// IPC server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
    /// Detector events fanned out to subscribed clients
    events: broadcast::Sender<DetectorEvent>,
}

/// Shared server state
struct ServerState {
    status: DaemonStatus,
    start_time: std::time::Instant,
}

impl Server {
    /// Create a new IPC server bound to the given socket path
    pub fn new(
        socket_path: &Path,
        status: DaemonStatus,
        events: broadcast::Sender<DetectorEvent>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(RwLock::new(ServerState {
            status,
            start_time: std::time::Instant::now(),
        }));

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            state,
            shutdown_tx,
            events,
        })
    }

    /// Record whether the event tap is active
    pub async fn set_tap_active(&self, active: bool) {
        let mut state = self.state.write().await;
        state.status.tap_active = active;
    }

    /// Fold a detector event into the reported status
    pub async fn apply_event(&self, event: &DetectorEvent) {
        let mut state = self.state.write().await;
        match event {
            DetectorEvent::KeyHeld { .. } => {
                state.status.holding = true;
                state.status.holds_detected += 1;
            }
            DetectorEvent::HoldEnded { .. } | DetectorEvent::TapInterrupted => {
                state.status.holding = false;
            }
        }
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let state = Arc::clone(&self.state);
                    let events = self.events.subscribe();
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, state, events) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(
        mut stream: UnixStream,
        state: Arc<RwLock<ServerState>>,
        events: broadcast::Receiver<DetectorEvent>,
    ) -> Result<()> {
        let mut len_buf = [0u8; 4];

        loop {
            // Read message length (4-byte little-endian)
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len > 1024 * 1024 {
                warn!(len, "message too large, disconnecting");
                return Ok(());
            }

            // Read message body
            let mut msg_buf = vec![0u8; len];
            stream.read_exact(&mut msg_buf).await?;

            // Parse request
            let request: Request = match serde_json::from_slice(&msg_buf) {
                Ok(request) => request,
                Err(e) => {
                    warn!(?e, "failed to parse request");
                    let response = Response::Error {
                        code: "bad_request".to_string(),
                        message: e.to_string(),
                    };
                    Self::send_message(&mut stream, &response).await?;
                    return Ok(());
                }
            };

            debug!(?request, "received request");

            let subscribe = matches!(request, Request::Subscribe);
            let response = Self::process_request(request, &state).await;
            Self::send_message(&mut stream, &response).await?;

            if subscribe {
                debug!("client subscribed to notifications");
                return Self::stream_notifications(stream, events).await;
            }
        }
    }

    /// Push detector events to a subscribed client until it disconnects
    async fn stream_notifications(
        mut stream: UnixStream,
        mut events: broadcast::Receiver<DetectorEvent>,
    ) -> Result<()> {
        let mut probe = [0u8; 1];

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        Self::send_message(&mut stream, &Notification::Event { event }).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "subscriber lagged, notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
                read = stream.read(&mut probe) => {
                    if read? == 0 {
                        debug!("subscriber disconnected");
                    } else {
                        // The connection is push-only after Subscribe.
                        warn!("subscriber sent data on a push-only connection, disconnecting");
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Send a length-prefixed JSON message
    async fn send_message<T: serde::Serialize>(stream: &mut UnixStream, msg: &T) -> Result<()> {
        let msg_bytes = serde_json::to_vec(msg)?;
        let msg_len = (msg_bytes.len() as u32).to_le_bytes();

        stream.write_all(&msg_len).await?;
        stream.write_all(&msg_bytes).await?;

        Ok(())
    }

    /// Process a request and return a response
    async fn process_request(request: Request, state: &Arc<RwLock<ServerState>>) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::GetStatus => {
                let mut state = state.write().await;
                state.status.uptime_secs = state.start_time.elapsed().as_secs();
                Response::Status(state.status.clone())
            }

            Request::Subscribe => Response::Subscribed,
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_socket(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("holdkey-test-{}-{}.sock", tag, std::process::id()))
    }

    async fn fetch_status(server: &Server) -> DaemonStatus {
        match Server::process_request(Request::GetStatus, &server.state).await {
            Response::Status(status) => status,
            other => panic!("expected status response, got {:?}", other),
        }
    }

    #[test]
    fn test_status_tracks_detector_events() {
        tokio_test::block_on(async {
            let (events, _rx) = broadcast::channel(8);
            let socket = temp_socket("status");
            let server = Server::new(&socket, DaemonStatus::new("space", 250), events).unwrap();

            server
                .apply_event(&DetectorEvent::KeyHeld {
                    key: "space".to_string(),
                })
                .await;
            let status = fetch_status(&server).await;
            assert!(status.holding);
            assert_eq!(status.holds_detected, 1);

            server
                .apply_event(&DetectorEvent::HoldEnded {
                    key: "space".to_string(),
                    held_ms: 10,
                })
                .await;
            assert!(!fetch_status(&server).await.holding);

            server.shutdown().await;
            let _ = std::fs::remove_file(&socket);
        });
    }

    #[test]
    fn test_stale_socket_is_replaced() {
        tokio_test::block_on(async {
            let (events, _rx) = broadcast::channel(8);
            let socket = temp_socket("stale");

            let first = Server::new(&socket, DaemonStatus::new("space", 250), events.clone());
            assert!(first.is_ok());

            // A second bind over the leftover socket file must succeed.
            let second = Server::new(&socket, DaemonStatus::new("space", 250), events);
            assert!(second.is_ok());

            let _ = std::fs::remove_file(&socket);
        });
    }
}
