//! Unix domain socket server for the orb window
//!
//! Provides request-response communication plus push notifications for
//! subscribed clients. Press and release requests are forwarded to the
//! voice engine; hover state is combined with the engine mode to decide
//! whether the orb window should be click-through.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::events::StateEvent;
use crate::speech::CaptureStrategy;
use crate::state::{EngineHandle, Mode};

use super::protocol::{DaemonStatus, Notification, Request, Response};

/// Largest accepted request body
const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Bridge server handling orb window connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

/// State shared by every client handler
struct Shared {
    state: RwLock<ServerState>,
    notify_tx: broadcast::Sender<Notification>,
    engine: EngineHandle,
}

struct ServerState {
    status: DaemonStatus,
    start_time: Instant,
    hovered: bool,
}

impl ServerState {
    /// Recompute click-through; returns the new value if it changed
    fn refresh_click_through(&mut self) -> Option<bool> {
        let enabled = self.status.mode == Mode::Idle && !self.hovered;
        if enabled == self.status.click_through {
            return None;
        }
        self.status.click_through = enabled;
        Some(enabled)
    }
}

impl Server {
    /// Bind the bridge socket
    pub fn new(socket_path: &Path, engine: EngineHandle, strategy: CaptureStrategy) -> Result<Self> {
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
        let (notify_tx, _) = broadcast::channel(64);

        let shared = Arc::new(Shared {
            state: RwLock::new(ServerState {
                status: DaemonStatus::new(strategy),
                start_time: Instant::now(),
                hovered: false,
            }),
            notify_tx,
            engine,
        });

        info!(?socket_path, "bridge listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            shared,
            shutdown_tx,
        })
    }

    /// Fold an engine event into the status and push it to subscribers
    pub async fn apply_event(&self, event: &StateEvent) {
        let mut state = self.shared.state.write().await;

        match event {
            StateEvent::ModeChanged { mode, previous, .. } => {
                state.status.mode = *mode;
                self.shared.notify(Notification::ModeChanged {
                    mode: *mode,
                    previous: *previous,
                });
                if let Some(enabled) = state.refresh_click_through() {
                    self.shared.notify(Notification::ClickThrough { enabled });
                }
            }
            StateEvent::StrategyEscalated { strategy } => {
                state.status.strategy = *strategy;
            }
            _ => {}
        }

        self.shared.notify(Notification::StateEvent {
            event: event.clone(),
        });
    }

    /// Bring the reported mode back in line with the engine after missed
    /// state events
    pub async fn sync_mode(&self, mode: Mode) {
        let mut state = self.shared.state.write().await;
        let previous = state.status.mode;
        if previous == mode {
            return;
        }
        warn!(%previous, %mode, "bridge mode was stale, resynchronizing");

        state.status.mode = mode;
        self.shared.notify(Notification::ModeChanged { mode, previous });
        if let Some(enabled) = state.refresh_click_through() {
            self.shared.notify(Notification::ClickThrough { enabled });
        }
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let shared = Arc::clone(&self.shared);
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, shared) => {
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
    async fn handle_client(stream: UnixStream, shared: Arc<Shared>) -> Result<()> {
        let (reader, mut writer) = stream.into_split();

        // Frames are read on their own task so a half-read request is never
        // lost to a notification winning the select below
        let (request_tx, mut request_rx) = mpsc::channel(16);
        let read_task = tokio::spawn(Self::read_requests(reader, request_tx));

        let mut notifications: Option<broadcast::Receiver<Notification>> = None;

        loop {
            tokio::select! {
                request = request_rx.recv() => {
                    let Some(request) = request else {
                        debug!("client disconnected");
                        break;
                    };
                    let response = match request {
                        Ok(request) => {
                            debug!(?request, "received request");
                            Self::process_request(request, &shared).await
                        }
                        Err(message) => Response::error("invalid_request", message),
                    };
                    if response == Response::Subscribed && notifications.is_none() {
                        notifications = Some(shared.notify_tx.subscribe());
                        debug!("client subscribed to notifications");
                    }
                    Self::send_message(&mut writer, &response).await?;
                }
                notification = Self::next_notification(&mut notifications) => match notification {
                    Ok(notification) => Self::send_message(&mut writer, &notification).await?,
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "subscriber lagging, notifications dropped"),
                    Err(RecvError::Closed) => break,
                }
            }
        }

        read_task.abort();
        Ok(())
    }

    /// Read length-prefixed requests until EOF or an oversized frame
    async fn read_requests(
        mut reader: OwnedReadHalf,
        requests: mpsc::Sender<std::result::Result<Request, String>>,
    ) -> Result<()> {
        let mut len_buf = [0u8; 4];

        loop {
            match reader.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_MESSAGE_BYTES {
                warn!(len, "message too large, disconnecting");
                return Ok(());
            }

            let mut msg_buf = vec![0u8; len];
            reader.read_exact(&mut msg_buf).await?;

            let request = serde_json::from_slice(&msg_buf).map_err(|e| e.to_string());
            if requests.send(request).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn next_notification(
        notifications: &mut Option<broadcast::Receiver<Notification>>,
    ) -> std::result::Result<Notification, RecvError> {
        match notifications {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Send a length-prefixed JSON message
    async fn send_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
    where
        W: AsyncWrite + Unpin,
        T: serde::Serialize,
    {
        let msg_bytes = serde_json::to_vec(msg)?;
        let msg_len = (msg_bytes.len() as u32).to_le_bytes();

        writer.write_all(&msg_len).await?;
        writer.write_all(&msg_bytes).await?;

        Ok(())
    }

    /// Process a request and return a response
    async fn process_request(request: Request, shared: &Shared) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::GetStatus => {
                let mut state = shared.state.write().await;
                state.status.uptime_secs = state.start_time.elapsed().as_secs();
                Response::Status(state.status.clone())
            }

            Request::Subscribe => Response::Subscribed,

            Request::Press => {
                shared.state.write().await.status.hold = true;
                shared.forward(shared.engine.press())
            }

            Request::Release => {
                shared.state.write().await.status.hold = false;
                shared.forward(shared.engine.release())
            }

            Request::SetHover { hovered } => {
                let mut state = shared.state.write().await;
                state.hovered = hovered;
                if let Some(enabled) = state.refresh_click_through() {
                    shared.notify(Notification::ClickThrough { enabled });
                }
                Response::Ack
            }

            Request::OpenChat => {
                info!("chat window requested");
                shared.notify(Notification::OpenChat);
                Response::Ack
            }
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("bridge shutdown complete");
    }
}

impl Shared {
    fn notify(&self, notification: Notification) {
        // No subscribers is fine
        let _ = self.notify_tx.send(notification);
    }

    fn forward(&self, delivered: bool) -> Response {
        if delivered {
            Response::Ack
        } else {
            Response::error("engine_unavailable", "voice engine has stopped")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::state::Event;

    struct Client {
        stream: UnixStream,
    }

    impl Client {
        async fn connect(path: &Path) -> Self {
            Self {
                stream: UnixStream::connect(path).await.unwrap(),
            }
        }

        async fn send_raw(&mut self, body: &[u8]) {
            self.stream
                .write_all(&(body.len() as u32).to_le_bytes())
                .await
                .unwrap();
            self.stream.write_all(body).await.unwrap();
        }

        async fn send(&mut self, request: &Request) {
            let body = serde_json::to_vec(request).unwrap();
            self.send_raw(&body).await;
        }

        async fn recv(&mut self) -> serde_json::Value {
            let mut len_buf = [0u8; 4];
            tokio::time::timeout(Duration::from_secs(5), self.stream.read_exact(&mut len_buf))
                .await
                .expect("timed out waiting for a message")
                .unwrap();
            let mut body = vec![0u8; u32::from_le_bytes(len_buf) as usize];
            self.stream.read_exact(&mut body).await.unwrap();
            serde_json::from_slice(&body).unwrap()
        }

        async fn request(&mut self, request: &Request) -> serde_json::Value {
            self.send(request).await;
            self.recv().await
        }
    }

    async fn start() -> (
        tempfile::TempDir,
        Arc<Server>,
        UnboundedReceiver<Event>,
        PathBuf,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let (engine, events) = EngineHandle::detached();
        let server = Arc::new(Server::new(&path, engine, CaptureStrategy::LocalRecognition).unwrap());

        let running = Arc::clone(&server);
        tokio::spawn(async move { running.run().await });
        (dir, server, events, path)
    }

    #[tokio::test]
    async fn test_ping_and_status() {
        let (_dir, _server, _events, path) = start().await;
        let mut client = Client::connect(&path).await;

        assert_eq!(client.request(&Request::Ping).await["type"], "pong");

        let status = client.request(&Request::GetStatus).await;
        assert_eq!(status["type"], "status");
        assert_eq!(status["mode"], "idle");
        assert_eq!(status["strategy"], "local-recognition");
        assert_eq!(status["hold"], false);
        assert_eq!(status["version"], env!("CARGO_PKG_VERSION"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_socket_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, _server, _events, path) = start().await;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_press_and_release_reach_the_engine() {
        let (_dir, _server, mut events, path) = start().await;
        let mut client = Client::connect(&path).await;

        assert_eq!(client.request(&Request::Press).await["type"], "ack");
        assert_eq!(client.request(&Request::GetStatus).await["hold"], true);
        assert_eq!(client.request(&Request::Release).await["type"], "ack");

        assert!(matches!(events.recv().await, Some(Event::HoldPressed)));
        assert!(matches!(events.recv().await, Some(Event::HoldReleased)));
    }

    #[tokio::test]
    async fn test_press_after_engine_stopped_is_an_error() {
        let (_dir, _server, events, path) = start().await;
        drop(events);
        let mut client = Client::connect(&path).await;

        let response = client.request(&Request::Press).await;
        assert_eq!(response["type"], "error");
        assert_eq!(response["code"], "engine_unavailable");
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_and_connection_survives() {
        let (_dir, _server, _events, path) = start().await;
        let mut client = Client::connect(&path).await;

        client.send_raw(b"{\"type\":\"dance\"}").await;
        let response = client.recv().await;
        assert_eq!(response["type"], "error");
        assert_eq!(response["code"], "invalid_request");

        assert_eq!(client.request(&Request::Ping).await["type"], "pong");
    }

    #[tokio::test]
    async fn test_subscriber_receives_mode_and_click_through() {
        let (_dir, server, _events, path) = start().await;
        let mut client = Client::connect(&path).await;
        assert_eq!(client.request(&Request::Subscribe).await["type"], "subscribed");

        server
            .apply_event(&StateEvent::ModeChanged {
                mode: Mode::Listening,
                previous: Mode::Idle,
                duration_ms: 10,
            })
            .await;

        let changed = client.recv().await;
        assert_eq!(changed["type"], "mode_changed");
        assert_eq!(changed["mode"], "listening");
        assert_eq!(changed["previous"], "idle");

        let click = client.recv().await;
        assert_eq!(click["type"], "click_through");
        assert_eq!(click["enabled"], false);

        let forwarded = client.recv().await;
        assert_eq!(forwarded["type"], "state_event");
        assert_eq!(forwarded["event"]["type"], "mode_changed");
    }

    #[tokio::test]
    async fn test_sync_mode_repairs_a_stale_view() {
        let (_dir, server, _events, path) = start().await;
        let mut client = Client::connect(&path).await;
        assert_eq!(client.request(&Request::Subscribe).await["type"], "subscribed");

        // The ModeChanged for this transition never reached the bridge
        server.sync_mode(Mode::Thinking).await;

        let changed = client.recv().await;
        assert_eq!(changed["type"], "mode_changed");
        assert_eq!(changed["mode"], "thinking");
        assert_eq!(changed["previous"], "idle");
        assert_eq!(client.recv().await["enabled"], false);

        // Already in sync: nothing is pushed ahead of the status reply
        server.sync_mode(Mode::Thinking).await;
        let status = client.request(&Request::GetStatus).await;
        assert_eq!(status["type"], "status");
        assert_eq!(status["mode"], "thinking");
        assert_eq!(status["click_through"], false);
    }

    #[tokio::test]
    async fn test_hover_disables_click_through_while_idle() {
        let (_dir, _server, _events, path) = start().await;
        let mut watcher = Client::connect(&path).await;
        watcher.request(&Request::Subscribe).await;

        let mut orb = Client::connect(&path).await;
        orb.request(&Request::SetHover { hovered: true }).await;

        let click = watcher.recv().await;
        assert_eq!(click["type"], "click_through");
        assert_eq!(click["enabled"], false);

        orb.request(&Request::SetHover { hovered: false }).await;
        assert_eq!(watcher.recv().await["enabled"], true);
        assert_eq!(orb.request(&Request::GetStatus).await["click_through"], true);
    }

    #[tokio::test]
    async fn test_open_chat_is_relayed() {
        let (_dir, _server, _events, path) = start().await;
        let mut shell = Client::connect(&path).await;
        shell.request(&Request::Subscribe).await;

        let mut orb = Client::connect(&path).await;
        assert_eq!(orb.request(&Request::OpenChat).await["type"], "ack");
        assert_eq!(shell.recv().await["type"], "open_chat");
    }

    #[tokio::test]
    async fn test_shutdown_removes_socket() {
        let (_dir, server, _events, path) = start().await;
        assert!(path.exists());
        server.shutdown().await;
        assert!(!path.exists());
    }
}
