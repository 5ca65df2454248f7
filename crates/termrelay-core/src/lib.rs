//! termrelay-core: Shared protocol library for the terminal relay.
//!
//! Provides the JSON wire messages exchanged with browser clients, the
//! project-path → session-key derivation, and the common error type.

pub mod error;
pub mod key;
pub mod messages;

// Re-export commonly used items at crate root.
pub use error::{RelayError, RelayResult};
pub use key::{normalize_project_path, session_key};
pub use messages::{decode_client, encode_server, ClientMessage, InitPayload, ServerMessage};
