//! Server configuration: TOML file + CLI overrides.

use crate::session::{RegistrySettings, ShellSettings};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use termrelay_core::{RelayError, RelayResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub shell: ShellSection,
    /// Passed verbatim to every spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[sessions]` section of the config TOML. Durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_buffer_max_entries")]
    pub buffer_max_entries: usize,
    #[serde(default = "default_buffer_trim_to")]
    pub buffer_trim_to: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval: u64,
    #[serde(default = "default_kill_grace")]
    pub kill_grace: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            buffer_max_entries: default_buffer_max_entries(),
            buffer_trim_to: default_buffer_trim_to(),
            idle_timeout: default_idle_timeout(),
            reap_interval: default_reap_interval(),
            kill_grace: default_kill_grace(),
            max_sessions: default_max_sessions(),
            default_cols: default_cols(),
            default_rows: default_rows(),
        }
    }
}

/// `[shell]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_assistant_command")]
    pub assistant_command: String,
    #[serde(default = "default_resume_flag")]
    pub resume_flag: String,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            assistant_command: default_assistant_command(),
            resume_flag: default_resume_flag(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3001
}
fn default_buffer_max_entries() -> usize {
    1000
}
fn default_buffer_trim_to() -> usize {
    800
}
fn default_idle_timeout() -> u64 {
    2 * 60 * 60
}
fn default_reap_interval() -> u64 {
    10 * 60
}
fn default_kill_grace() -> u64 {
    5
}
fn default_max_sessions() -> usize {
    64
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}
fn default_assistant_command() -> String {
    "claude".to_string()
}
fn default_resume_flag() -> String {
    "--resume".to_string()
}

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "~/.termrelay/config.toml";

/// Values given on the command line; each one beats the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub idle_timeout: Option<u64>,
    pub reap_interval: Option<u64>,
    pub shell: Option<String>,
    pub assistant_command: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    /// WebSocket port. The management API listens on `port + 1`.
    pub port: u16,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub default_cols: u16,
    pub default_rows: u16,
    pub registry: RegistrySettings,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file yields defaults; a malformed one is an error.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> RelayResult<Self> {
        let bind_str = overrides.bind.unwrap_or(file.server.bind);
        let bind: IpAddr = bind_str
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid bind address {bind_str:?}: {e}")))?;
        let port = overrides.port.unwrap_or(file.server.port);
        if port == u16::MAX {
            return Err(RelayError::Config(format!(
                "port {port} leaves no room for the management port"
            )));
        }

        let sessions = file.sessions;
        if sessions.buffer_max_entries == 0 {
            return Err(RelayError::Config("buffer_max_entries must be positive".into()));
        }
        if sessions.max_sessions == 0 {
            return Err(RelayError::Config("max_sessions must be positive".into()));
        }
        let idle_timeout = overrides.idle_timeout.unwrap_or(sessions.idle_timeout);
        let reap_interval = overrides.reap_interval.unwrap_or(sessions.reap_interval);
        if reap_interval == 0 {
            return Err(RelayError::Config("reap_interval must be positive".into()));
        }

        let shell = ShellSettings {
            shell: overrides.shell.unwrap_or(file.shell.shell),
            assistant_command: overrides
                .assistant_command
                .unwrap_or(file.shell.assistant_command),
            resume_flag: file.shell.resume_flag,
            env: file.env,
        };

        Ok(Self {
            bind,
            port,
            idle_timeout: Duration::from_secs(idle_timeout),
            reap_interval: Duration::from_secs(reap_interval),
            default_cols: sessions.default_cols,
            default_rows: sessions.default_rows,
            registry: RegistrySettings {
                max_sessions: sessions.max_sessions,
                buffer_max_entries: sessions.buffer_max_entries,
                buffer_trim_to: sessions.buffer_trim_to,
                kill_grace: Duration::from_secs(sessions.kill_grace),
                shell,
            },
        })
    }

    pub fn ws_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn api_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port + 1)
    }
}

fn parse_config(content: &str) -> RelayResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::resolve(ConfigFile::default(), ConfigOverrides::default()).unwrap();
        assert_eq!(config.ws_addr(), "127.0.0.1:3001".parse().unwrap());
        assert_eq!(config.api_addr(), "127.0.0.1:3002".parse().unwrap());
        assert_eq!(config.idle_timeout, Duration::from_secs(7200));
        assert_eq!(config.reap_interval, Duration::from_secs(600));
        assert_eq!(config.registry.buffer_max_entries, 1000);
        assert_eq!(config.registry.buffer_trim_to, 800);
        assert_eq!(config.registry.kill_grace, Duration::from_secs(5));
        assert_eq!(config.registry.shell.assistant_command, "claude");
        assert_eq!(config.registry.shell.resume_flag, "--resume");
        assert_eq!((config.default_cols, config.default_rows), (80, 24));
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let file = parse_config(
            r#"
            [server]
            bind = "0.0.0.0"
            port = 4000

            [sessions]
            idle_timeout = 60
            max_sessions = 3

            [shell]
            shell = "/bin/zsh"
            assistant_command = "assistant"

            [env]
            ANTHROPIC_BASE_URL = "http://localhost:8080"
            "#,
        )
        .unwrap();

        let config = ServerConfig::resolve(
            file,
            ConfigOverrides {
                port: Some(5000),
                shell: Some("/bin/bash".into()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(config.ws_addr(), "0.0.0.0:5000".parse().unwrap());
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.registry.max_sessions, 3);
        assert_eq!(config.registry.shell.shell, "/bin/bash");
        assert_eq!(config.registry.shell.assistant_command, "assistant");
        assert_eq!(
            config.registry.shell.env.get("ANTHROPIC_BASE_URL").map(String::as_str),
            Some("http://localhost:8080")
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(parse_config("[server]\nport = \"x\""), Err(RelayError::Config(_))));

        let bad_bind = ConfigOverrides {
            bind: Some("not-an-ip".into()),
            ..Default::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), bad_bind).is_err());

        let no_reap = ConfigOverrides {
            reap_interval: Some(0),
            ..Default::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), no_reap).is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            ServerConfig::load(Some(&dir.path().join("absent.toml")), ConfigOverrides::default())
                .unwrap();
        assert_eq!(config.port, 3001);
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sessions]\nreap_interval = 30\n").unwrap();
        let config = ServerConfig::load(Some(&path), ConfigOverrides::default()).unwrap();
        assert_eq!(config.reap_interval, Duration::from_secs(30));
    }

    #[test]
    fn tilde_expansion() {
        assert_eq!(expand_tilde_str("/abs/path"), PathBuf::from("/abs/path"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x/y"), home.join("x/y"));
        }
    }
}
