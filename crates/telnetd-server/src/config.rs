//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use telnetd_core::{TelnetdError, TelnetdResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_issue_file")]
    pub issue_file: String,
    #[serde(default = "default_session_id_file")]
    pub session_id_file: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            login_path: default_login_path(),
            issue_file: default_issue_file(),
            session_id_file: default_session_id_file(),
        }
    }
}

fn default_port() -> u16 {
    23
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_login_path() -> String {
    "/bin/login".to_string()
}
fn default_issue_file() -> String {
    "/etc/issue.net".to_string()
}
fn default_session_id_file() -> String {
    "/home/atlas/status/con_session_id.txt".to_string()
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Serve a single inherited connection on fds 0/1 instead of listening.
    pub inherited: bool,
    /// Reap exited login processes and close their sessions.
    pub watch_child: bool,
    pub login_path: PathBuf,
    pub issue_file: PathBuf,
    pub session_id_file: PathBuf,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_bind: Option<&str>,
        cli_login_path: Option<&str>,
        cli_issue_file: Option<&str>,
        cli_session_id_file: Option<&str>,
        inherited: bool,
        watch_child: bool,
    ) -> TelnetdResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| TelnetdError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let port = cli_port.unwrap_or(file_config.server.port);
        let bind = cli_bind
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.bind);
        let login_path = cli_login_path
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.login_path);
        let issue_file = cli_issue_file
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.issue_file);
        let session_id_file = cli_session_id_file
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.session_id_file);

        let addr: SocketAddr = format!("{bind}:{port}")
            .parse()
            .map_err(|e| TelnetdError::Config(format!("bad bind address {bind}:{port}: {e}")))?;

        Ok(Self {
            addr,
            inherited,
            watch_child,
            login_path: expand_tilde_str(&login_path),
            issue_file: expand_tilde_str(&issue_file),
            session_id_file: expand_tilde_str(&session_id_file),
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_classic_daemon() {
        let section = ServerSection::default();
        assert_eq!(section.port, 23);
        assert_eq!(section.login_path, "/bin/login");
        assert_eq!(section.issue_file, "/etc/issue.net");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let parsed: ConfigFile = toml::from_str("[server]\nport = 2323\n").unwrap();
        assert_eq!(parsed.server.port, 2323);
        assert_eq!(parsed.server.bind, "0.0.0.0");
    }

    #[test]
    fn cli_overrides_win() {
        let cfg = ServerConfig::load(
            None,
            Some(2424),
            Some("127.0.0.1"),
            Some("/bin/sh"),
            None,
            None,
            false,
            true,
        )
        .unwrap();
        assert_eq!(cfg.addr, "127.0.0.1:2424".parse().unwrap());
        assert_eq!(cfg.login_path, PathBuf::from("/bin/sh"));
        assert!(cfg.watch_child);
    }
}
