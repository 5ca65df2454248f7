//! Persistent sessions: PTY lifecycle, output buffering, transport binding.

pub mod interceptor;
pub mod launch;
pub mod multiplexer;
pub mod output_buffer;
pub mod pty;
pub mod reaper;
pub mod registry;

pub use launch::ShellSettings;
pub use multiplexer::Multiplexer;
pub use pty::{PtyEvent, PtyHandle};
pub use reaper::spawn_reaper;
pub use registry::{RegistrySettings, SessionRegistry, SessionStatus};
