//! Binds at most one live transport to a session.
//!
//! Attaching evicts the previous transport (the socket is closed, the PTY
//! is untouched) and replays the buffered output before any live output can
//! reach the new transport: both happen under the registry write lock that
//! the output pump also needs. Detaching only clears the reference.

use super::interceptor::UrlInterceptor;
use super::registry::{Session, SessionRegistry};
use crate::transport::TransportHandle;
use std::path::Path;
use std::sync::Arc;
use termrelay_core::{session_key, RelayResult, ServerMessage};
use tracing::{debug, info, warn};

const REPLAY_END: &str = "\x1b[36m.. end previous output ..\x1b[0m\r\n";

fn replay_start(entries: usize) -> String {
    format!("\x1b[36m.. restoring previous output ({entries} entries) ..\x1b[0m\r\n")
}

impl Session {
    /// Buffer a chunk of PTY output and forward it to the bound transport,
    /// emitting a `url_open` for every URL the interceptor finds.
    pub(crate) fn deliver_output(&mut self, chunk: Vec<u8>, interceptor: &UrlInterceptor) {
        if let Some(transport) = self.transport.as_ref().filter(|t| t.is_open()) {
            let text = String::from_utf8_lossy(&chunk);
            let scanned = interceptor.scan(&text);
            for url in scanned.urls {
                debug!(key = %self.key, url = %url, "url open requested");
                transport.send(ServerMessage::UrlOpen { url });
            }
            transport.send(ServerMessage::Output { data: scanned.text });
        }
        self.output.push(chunk);
    }

    /// Bind `transport`, evicting any previous one, and replay the buffer to
    /// it. Returns the number of replayed entries.
    pub(crate) fn bind(&mut self, transport: TransportHandle) -> usize {
        if let Some(previous) = self.transport.take() {
            if previous.id() != transport.id() {
                info!(
                    key = %self.key,
                    evicted = previous.id(),
                    transport_id = transport.id(),
                    "evicting previous transport"
                );
                previous.close("replaced by a newer connection");
            }
        }
        self.touch();

        if !self.output.is_empty() {
            transport.send(ServerMessage::output(replay_start(self.output.len())));
            for entry in self.output.entries() {
                transport.send(ServerMessage::output_bytes(&entry.data));
            }
            transport.send(ServerMessage::output(REPLAY_END));
        }
        self.transport = Some(transport);
        self.output.len()
    }
}

/// Transport-side operations on registry sessions.
#[derive(Clone)]
pub struct Multiplexer {
    registry: Arc<SessionRegistry>,
}

impl Multiplexer {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind a transport to the project's session and replay its buffer.
    ///
    /// Returns the number of replayed entries.
    pub async fn attach(&self, project_path: &Path, transport: TransportHandle) -> RelayResult<usize> {
        let key = session_key(project_path);
        let transport_id = transport.id();
        let replayed = self
            .registry
            .with_session_mut(&key, |s| Ok(s.bind(transport)))
            .await?;
        info!(key = %key, transport_id, replayed, "transport attached");
        Ok(replayed)
    }

    /// Unbind `transport_id` if it is still the bound transport. The PTY
    /// keeps running and buffering.
    pub async fn detach(&self, project_path: &Path, transport_id: u64) -> bool {
        let key = session_key(project_path);
        let detached = self
            .registry
            .with_session_mut(&key, |s| {
                let ours = s.transport.as_ref().is_some_and(|t| t.id() == transport_id);
                if ours {
                    s.transport = None;
                }
                Ok(ours)
            })
            .await
            .unwrap_or(false);
        if detached {
            info!(key = %key, transport_id, "transport detached");
        } else {
            debug!(key = %key, transport_id, "detach ignored, not the bound transport");
        }
        detached
    }

    /// Forward input to the PTY. `false` if there is no live process.
    pub async fn write(&self, project_path: &Path, data: &[u8]) -> bool {
        let key = session_key(project_path);
        let result = self
            .registry
            .with_session_mut(&key, |s| {
                s.touch();
                Ok(s.pty.write(data))
            })
            .await;
        match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "write after exit ignored");
                false
            }
            Err(_) => {
                debug!(key = %key, "write to unknown session ignored");
                false
            }
        }
    }

    /// Resize the PTY. `false` if there is no live process.
    pub async fn resize(&self, project_path: &Path, cols: u16, rows: u16) -> bool {
        let key = session_key(project_path);
        self.registry
            .with_session_mut(&key, |s| Ok(s.apply_resize(cols, rows)))
            .await
            .unwrap_or_else(|_| {
                debug!(key = %key, "resize of unknown session ignored");
                false
            })
    }
}
