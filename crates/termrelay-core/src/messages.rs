//! JSON wire messages exchanged over the shell transport.
//!
//! Every frame is a JSON object tagged by `"type"`. Field names inside the
//! `init` payload follow the browser client's camelCase convention.

use crate::error::RelayResult;
use serde::{Deserialize, Serialize};

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a shell connection: selects the project and mode.
    Init(InitPayload),
    /// Keystrokes / pasted text for the PTY.
    Input { data: String },
    /// Terminal dimensions changed.
    Resize { cols: u16, rows: u16 },
}

/// Payload of the `init` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub project_path: String,
    /// Upstream assistant conversation to resume.
    #[serde(default, alias = "sessionId", skip_serializing_if = "Option::is_none")]
    pub resume_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default)]
    pub ephemeral: bool,
    /// Initial command for ephemeral shells.
    #[serde(default, alias = "initialCommand", skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Terminal output (live or replayed).
    Output { data: String },
    /// The subprocess asked for a URL to be opened in a new browsing context.
    UrlOpen { url: String },
}

impl ServerMessage {
    /// Build an `output` message from raw PTY bytes (lossy on invalid UTF-8).
    pub fn output_bytes(data: &[u8]) -> Self {
        ServerMessage::Output {
            data: String::from_utf8_lossy(data).into_owned(),
        }
    }

    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output { data: data.into() }
    }
}

/// Decode a client frame.
pub fn decode_client(text: &str) -> RelayResult<ClientMessage> {
    Ok(serde_json::from_str(text)?)
}

/// Encode a server frame.
pub fn encode_server(msg: &ServerMessage) -> RelayResult<String> {
    Ok(serde_json::to_string(msg)?)
}
