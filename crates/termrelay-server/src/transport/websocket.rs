//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts upgrades on a single port and remembers the request path so the
//! router can classify the connection. Frames are JSON text; binary frames
//! are passed through as raw input bytes.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use termrelay_core::{RelayError, RelayResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
pub type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Maximum accepted client frame (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
    /// Path of the upgrade request, e.g. `/shell`.
    pub path: String,
}

/// A client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Bind and start accepting WebSocket upgrades.
///
/// Returns a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> RelayResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed: {e}")))?;
    Ok(accept_loop(tcp_listener))
}

/// Accept upgrades on an already bound listener.
pub fn accept_loop(tcp_listener: TcpListener) -> mpsc::Receiver<WebSocketConnection> {
    if let Ok(addr) = tcp_listener.local_addr() {
        info!(addr = %addr, "WebSocket listener started");
    }

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let mut path = String::new();
                        let callback =
                            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                                path = req.uri().path().to_string();
                                Ok(resp)
                            };
                        match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, path = %path, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    path,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    rx
}

/// Send a text frame.
pub async fn ws_send_text(sink: &mut WsSink, text: String) -> RelayResult<()> {
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| RelayError::Transport(format!("WS send failed: {e}")))
}

/// Send a close frame with a policy code. Errors are ignored: the peer may
/// already be gone.
pub async fn ws_close(sink: &mut WsSink, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::Policy,
        reason: reason.to_string().into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}

/// Receive the next data frame.
///
/// Returns `None` when the connection is closed. Control frames are skipped.
pub async fn ws_recv(source: &mut WsSource) -> RelayResult<Option<Frame>> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_WS_FRAME_SIZE {
                    return Err(RelayError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {MAX_WS_FRAME_SIZE})",
                        text.len()
                    )));
                }
                return Ok(Some(Frame::Text(text.to_string())));
            }
            Some(Ok(Message::Binary(data))) => {
                if data.len() > MAX_WS_FRAME_SIZE {
                    return Err(RelayError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {MAX_WS_FRAME_SIZE})",
                        data.len()
                    )));
                }
                return Ok(Some(Frame::Binary(data.to_vec())));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            // Pings are answered by tungstenite on the next flush.
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(RelayError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
