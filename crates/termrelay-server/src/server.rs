//! Core server: accepts connections and routes them by request path.
//!
//! Owns the session registry and coordinates the WebSocket listener, the
//! management API and the idle reaper.

use crate::api;
use crate::config::ServerConfig;
use crate::session::{spawn_reaper, Multiplexer, PtyEvent, PtyHandle, SessionRegistry};
use crate::transport::websocket::{self, Frame, WebSocketConnection, WsSink, WsSource};
use crate::transport::{Outbound, TransportHandle};
use futures_util::StreamExt;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use termrelay_core::{
    decode_client, encode_server, normalize_project_path, ClientMessage, InitPayload, RelayError,
    RelayResult, ServerMessage,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// What a connection asked for, by upgrade path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// `/shell`: persistent unless `init` says otherwise.
    Shell,
    /// `/shell/ephemeral`: always a throwaway shell.
    Ephemeral,
    /// `/chat`: not served here.
    Chat,
    Unknown,
}

impl ConnectionKind {
    pub fn classify(path: &str) -> Self {
        let path = match path.trim_end_matches('/') {
            "" => "/",
            p => p,
        };
        match path {
            "/shell" => ConnectionKind::Shell,
            "/shell/ephemeral" => ConnectionKind::Ephemeral,
            "/chat" => ConnectionKind::Chat,
            _ => ConnectionKind::Unknown,
        }
    }
}

/// Lifecycle of a persistent shell connection, tracked for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connecting,
    /// Bound; replay still draining to the socket.
    Attached,
    Live,
    /// Socket gone, process still running.
    Detached,
    /// Process gone.
    Killed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Attached => "attached",
            ConnectionState::Live => "live",
            ConnectionState::Detached => "detached",
            ConnectionState::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// The relay server instance.
pub struct RelayServer {
    config: ServerConfig,
    mux: Multiplexer,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> RelayResult<Self> {
        let registry = Arc::new(SessionRegistry::new(config.registry.clone())?);
        Ok(Self {
            config,
            mux: Multiplexer::new(registry),
            shutdown_tx: broadcast::channel(1).0,
        })
    }

    /// Stop background tasks, close every connection and kill every session.
    pub async fn shutdown(&self) {
        info!("broadcasting shutdown to connected clients");
        let _ = self.shutdown_tx.send(());
        self.mux.registry().shutdown().await;
    }

    /// Bind both listeners, start the reaper, and accept until the listener
    /// closes.
    pub async fn run(self: Arc<Self>) -> RelayResult<()> {
        let ws_addr = self.config.ws_addr();
        let api_addr = self.config.api_addr();

        let ws_rx = websocket::start_listener(ws_addr).await?;

        let api_listener = TcpListener::bind(api_addr)
            .await
            .map_err(|e| RelayError::Transport(format!("API bind failed on {api_addr}: {e}")))?;
        let mut api_shutdown = self.shutdown_tx.subscribe();
        let registry = self.mux.registry().clone();
        tokio::spawn(async move {
            let stop = async move {
                let _ = api_shutdown.recv().await;
            };
            if let Err(e) = api::serve(api_listener, registry, stop).await {
                warn!(error = %e, "management API stopped");
            }
        });

        let reaper = spawn_reaper(
            self.mux.registry().clone(),
            self.config.reap_interval,
            self.config.idle_timeout,
        );
        let mut reaper_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = reaper_shutdown.recv().await;
            reaper.abort();
            debug!("idle reaper stopped");
        });

        info!(ws_addr = %ws_addr, api_addr = %api_addr, "termrelay-server ready");

        self.serve_connections(ws_rx).await;
        info!("listener closed, shutting down");
        Ok(())
    }

    /// Route every accepted connection on its own task until the listener
    /// channel closes.
    pub async fn serve_connections(
        self: Arc<Self>,
        mut ws_rx: mpsc::Receiver<WebSocketConnection>,
    ) {
        while let Some(conn) = ws_rx.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                if let Err(e) = srv.handle_connection(conn).await {
                    warn!(error = %e, "connection error");
                }
            });
        }
    }

    async fn handle_connection(&self, conn: WebSocketConnection) -> RelayResult<()> {
        let remote = conn.remote_addr;
        let kind = ConnectionKind::classify(&conn.path);
        debug!(remote = %remote, path = %conn.path, ?kind, "routing connection");
        let (mut sink, mut source) = conn.ws_stream.split();

        match kind {
            ConnectionKind::Chat => {
                info!(remote = %remote, "chat connection refused");
                websocket::ws_close(&mut sink, "chat is not served by this endpoint").await;
                Ok(())
            }
            ConnectionKind::Unknown => {
                info!(remote = %remote, path = %conn.path, "unknown path, closing");
                websocket::ws_close(&mut sink, "unknown endpoint").await;
                Ok(())
            }
            ConnectionKind::Shell | ConnectionKind::Ephemeral => {
                let Some(init) = wait_for_init(&mut source).await? else {
                    debug!(remote = %remote, "closed before init");
                    return Ok(());
                };
                let project = match project_path(&init) {
                    Ok(p) => p,
                    Err(e) => {
                        send_error(&mut sink, &e).await;
                        websocket::ws_close(&mut sink, "invalid init").await;
                        return Ok(());
                    }
                };
                if kind == ConnectionKind::Ephemeral || init.ephemeral {
                    self.ephemeral_loop(sink, source, &project, &init).await
                } else {
                    self.persistent_loop(sink, source, &project, &init).await
                }
            }
        }
    }

    /// Persistent shell: get or create the project's session, bind to it,
    /// and pump frames until the socket closes. The PTY survives the socket.
    async fn persistent_loop(
        &self,
        mut sink: WsSink,
        mut source: WsSource,
        project: &Path,
        init: &InitPayload,
    ) -> RelayResult<()> {
        let mut state = ConnectionState::Connecting;
        let cols = init.cols.unwrap_or(self.config.default_cols);
        let rows = init.rows.unwrap_or(self.config.default_rows);

        let (status, created) = match self
            .mux
            .registry()
            .get_or_create(project, init.resume_target.as_deref(), cols, rows)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(project = %project.display(), error = %e, "session unavailable");
                send_error(&mut sink, &e).await;
                websocket::ws_close(&mut sink, "spawn failed").await;
                return Ok(());
            }
        };
        let key = status.key;

        let (transport, mut outbound) = TransportHandle::new();
        let transport_id = transport.id();
        // Sent ahead of replay and never buffered.
        let mut pending = 0usize;
        if created {
            transport.send(ServerMessage::output(format!(
                "\x1b[32mStarting terminal in: {}\x1b[0m\r\n",
                project.display()
            )));
            pending += 1;
        }

        let replayed = match self.mux.attach(project, transport).await {
            Ok(n) => n,
            Err(e) => {
                warn!(key = %key, error = %e, "attach failed");
                send_error(&mut sink, &e).await;
                websocket::ws_close(&mut sink, "session ended").await;
                return Ok(());
            }
        };
        if replayed > 0 {
            pending += replayed + 2;
        }
        state = transition(&key, transport_id, state, ConnectionState::Attached);
        if pending == 0 {
            state = transition(&key, transport_id, state, ConnectionState::Live);
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    websocket::ws_close(&mut sink, "server shutting down").await;
                    break;
                }

                item = outbound.recv() => match item {
                    Some(Outbound::Message(msg)) => {
                        let text = match encode_server(&msg) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(key = %key, error = %e, "failed to encode outbound message");
                                continue;
                            }
                        };
                        if let Err(e) = websocket::ws_send_text(&mut sink, text).await {
                            debug!(key = %key, error = %e, "send failed, dropping connection");
                            break;
                        }
                        if state == ConnectionState::Attached {
                            pending = pending.saturating_sub(1);
                            if pending == 0 {
                                state = transition(&key, transport_id, state, ConnectionState::Live);
                            }
                        }
                    }
                    Some(Outbound::Close { reason }) => {
                        debug!(key = %key, transport_id, reason = %reason, "closing transport");
                        websocket::ws_close(&mut sink, &reason).await;
                        break;
                    }
                    // Session dropped the handle.
                    None => break,
                },

                frame = websocket::ws_recv(&mut source) => match frame {
                    Ok(Some(Frame::Text(text))) => match decode_client(&text) {
                        Ok(ClientMessage::Input { data }) => {
                            self.mux.write(project, data.as_bytes()).await;
                        }
                        Ok(ClientMessage::Resize { cols, rows }) => {
                            self.mux.resize(project, cols, rows).await;
                        }
                        Ok(ClientMessage::Init(_)) => {
                            debug!(key = %key, "repeated init ignored");
                        }
                        Err(e) => {
                            debug!(key = %key, error = %e, "unparseable frame ignored");
                        }
                    },
                    Ok(Some(Frame::Binary(data))) => {
                        self.mux.write(project, &data).await;
                    }
                    Ok(None) => {
                        debug!(key = %key, "peer closed");
                        break;
                    }
                    Err(e) => {
                        debug!(key = %key, error = %e, "WebSocket session ended");
                        break;
                    }
                },
            }
        }

        if self.mux.registry().status_key(&key).await.exists {
            self.mux.detach(project, transport_id).await;
            transition(&key, transport_id, state, ConnectionState::Detached);
        } else {
            transition(&key, transport_id, state, ConnectionState::Killed);
        }
        Ok(())
    }

    /// Ephemeral shell: a private PTY with raw output and no replay, killed
    /// when the socket goes away.
    async fn ephemeral_loop(
        &self,
        mut sink: WsSink,
        mut source: WsSource,
        project: &Path,
        init: &InitPayload,
    ) -> RelayResult<()> {
        let cols = init.cols.unwrap_or(self.config.default_cols);
        let rows = init.rows.unwrap_or(self.config.default_rows);
        let spec = self
            .config
            .registry
            .shell
            .ephemeral_spec(project, init.command.as_deref(), cols, rows);

        let (mut pty, mut events) = match PtyHandle::spawn_async(spec).await {
            Ok(v) => v,
            Err(e) => {
                warn!(project = %project.display(), error = %e, "ephemeral spawn failed");
                send_error(&mut sink, &e).await;
                websocket::ws_close(&mut sink, "spawn failed").await;
                return Ok(());
            }
        };
        info!(project = %project.display(), pid = ?pty.pid(), "ephemeral shell started");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    websocket::ws_close(&mut sink, "server shutting down").await;
                    break Ok(());
                }

                event = events.recv() => match event {
                    Some(PtyEvent::Data(chunk)) => {
                        let text = encode_server(&ServerMessage::output_bytes(&chunk))?;
                        if let Err(e) = websocket::ws_send_text(&mut sink, text).await {
                            break Err(e);
                        }
                    }
                    Some(PtyEvent::Exit { code }) => {
                        let msg = ServerMessage::output(format!(
                            "\r\n\x1b[33mProcess exited with code {code}\x1b[0m\r\n"
                        ));
                        if let Ok(text) = encode_server(&msg) {
                            let _ = websocket::ws_send_text(&mut sink, text).await;
                        }
                        websocket::ws_close(&mut sink, "process exited").await;
                        break Ok(());
                    }
                    None => break Ok(()),
                },

                frame = websocket::ws_recv(&mut source) => match frame {
                    Ok(Some(Frame::Text(text))) => match decode_client(&text) {
                        Ok(ClientMessage::Input { data }) => {
                            if let Err(e) = pty.write(data.as_bytes()) {
                                debug!(error = %e, "ephemeral write after exit");
                            }
                        }
                        Ok(ClientMessage::Resize { cols, rows }) => {
                            if let Err(e) = pty.resize(cols, rows) {
                                warn!(cols, rows, error = %e, "ephemeral resize failed");
                            }
                        }
                        Ok(ClientMessage::Init(_)) => debug!("repeated init ignored"),
                        Err(e) => debug!(error = %e, "unparseable frame ignored"),
                    },
                    Ok(Some(Frame::Binary(data))) => {
                        if let Err(e) = pty.write(&data) {
                            debug!(error = %e, "ephemeral write after exit");
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
            }
        };

        if let Err(e) = pty.kill() {
            debug!(error = %e, "ephemeral kill failed");
        }
        info!(project = %project.display(), pid = ?pty.pid(), "ephemeral shell ended");
        result
    }
}

fn transition(
    key: &str,
    transport_id: u64,
    from: ConnectionState,
    to: ConnectionState,
) -> ConnectionState {
    info!(key, transport_id, from = %from, to = %to, "connection state");
    to
}

/// Read frames until an `init` arrives. Anything else is ignored.
async fn wait_for_init(source: &mut WsSource) -> RelayResult<Option<InitPayload>> {
    loop {
        match websocket::ws_recv(source).await? {
            Some(Frame::Text(text)) => match decode_client(&text) {
                Ok(ClientMessage::Init(init)) => return Ok(Some(init)),
                Ok(other) => debug!(?other, "message before init ignored"),
                Err(e) => debug!(error = %e, "unparseable frame before init ignored"),
            },
            Some(Frame::Binary(_)) => debug!("binary frame before init ignored"),
            None => return Ok(None),
        }
    }
}

fn project_path(init: &InitPayload) -> RelayResult<PathBuf> {
    let raw = init.project_path.trim();
    if raw.is_empty() {
        return Err(RelayError::InvalidMessage("init without projectPath".into()));
    }
    Ok(normalize_project_path(Path::new(raw)))
}

async fn send_error(sink: &mut WsSink, err: &RelayError) {
    let msg = ServerMessage::output(format!("\r\n\x1b[31mError: {err}\x1b[0m\r\n"));
    if let Ok(text) = encode_server(&msg) {
        let _ = websocket::ws_send_text(sink, text).await;
    }
}
