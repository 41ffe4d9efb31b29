use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::keyring;
use crate::core::models::Representation;

const DEFAULT_PORT: u16 = 993;
const DEFAULT_MAILBOX: &str = "INBOX";
const DEFAULT_RECENT_WINDOW: usize = 25;
const DEFAULT_CONNECT_DELAY_MS: u64 = 250;

/// Runtime config. The password is always a plain String in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub imap_server: String,
    pub imap_port: u16,
    pub username: String,
    pub password: String,
    pub use_starttls: bool,
    pub use_tls: bool,
    pub accept_invalid_certs: bool,
    pub mailbox: String,
    pub recent_window: usize,
    pub connect_delay: Duration,
    pub network: NetworkSource,
    pub viewer: ViewerConfig,
    /// Where transient message copies are written.
    pub spool_dir: PathBuf,
}

/// On-disk representation. Password is either a keyring reference or plaintext.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub starttls: bool,
    #[serde(default = "default_true")]
    pub tls: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    pub password: PasswordBackend,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
    #[serde(default = "default_connect_delay_ms")]
    pub connect_delay_ms: u64,
    #[serde(default)]
    pub network: NetworkSource,
    #[serde(default)]
    pub viewer: ViewerConfig,
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend")]
pub enum PasswordBackend {
    #[serde(rename = "keyring")]
    Keyring,
    #[serde(rename = "plaintext")]
    Plaintext { value: String },
}

/// Which service tells us whether the host is online. Exactly one, or none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum NetworkSource {
    /// No reachability service: treat the host as always online.
    #[default]
    None,
    NetworkManager,
    WpaSupplicant { interface: String },
    Connman,
}

/// External program plus leading arguments; the file path is appended.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ViewerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ViewerCommand {
    /// Parse `"program arg arg"` as given in environment variables.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(ViewerCommand {
            program,
            args: parts.collect(),
        })
    }
}

/// Per-representation viewers. `full` wins when set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ViewerConfig {
    #[serde(default)]
    pub full: Option<ViewerCommand>,
    #[serde(default)]
    pub text: Option<ViewerCommand>,
    #[serde(default)]
    pub html: Option<ViewerCommand>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        ViewerConfig {
            full: None,
            text: Some(ViewerCommand {
                program: "xterm".into(),
                args: vec!["-e".into(), "less".into()],
            }),
            html: None,
        }
    }
}

impl ViewerConfig {
    pub fn command(&self, representation: Representation) -> Option<&ViewerCommand> {
        match representation {
            Representation::Full => self.full.as_ref(),
            Representation::Text => self.text.as_ref(),
            Representation::Html => self.html.as_ref(),
        }
    }
}

/// Why no usable config could be produced.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration found: set MAILWATCH_SERVER/MAILWATCH_USER/MAILWATCH_PASSWORD or create {}", .0.display())]
    Missing(PathBuf),
    #[error("password for {username}@{server} unavailable: {error}")]
    PasswordUnavailable {
        server: String,
        username: String,
        error: String,
    },
    #[error("{0}")]
    Invalid(String),
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_mailbox() -> String {
    DEFAULT_MAILBOX.to_string()
}

fn default_recent_window() -> usize {
    DEFAULT_RECENT_WINDOW
}

fn default_connect_delay_ms() -> u64 {
    DEFAULT_CONNECT_DELAY_MS
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailwatch")
        .join("config.json")
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Option<Self>, String> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path).map_err(|e| format!("read config: {e}"))?;
        Self::parse(&data).map(Some)
    }

    pub fn parse(data: &str) -> Result<Self, String> {
        let cfg: FileConfig =
            serde_json::from_str(data).map_err(|e| format!("parse config: {e}"))?;
        if cfg.recent_window == 0 {
            return Err("parse config: recent_window must be at least 1".into());
        }
        Ok(cfg)
    }
}

impl Config {
    /// Try env vars. Returns None if any required var is missing.
    pub fn from_env() -> Option<Self> {
        let imap_server = std::env::var("MAILWATCH_SERVER").ok()?;
        let username = std::env::var("MAILWATCH_USER").ok()?;
        let password = std::env::var("MAILWATCH_PASSWORD").ok()?;
        let imap_port = std::env::var("MAILWATCH_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let use_starttls = std::env::var("MAILWATCH_STARTTLS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let mailbox = std::env::var("MAILWATCH_MAILBOX").unwrap_or_else(|_| default_mailbox());

        let env_viewer = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|line| ViewerCommand::from_command_line(&line))
        };
        let mut viewer = ViewerConfig::default();
        if let Some(full) = env_viewer("MAILWATCH_VIEWER_FULL") {
            viewer.full = Some(full);
        }
        if let Some(text) = env_viewer("MAILWATCH_VIEWER_TEXT") {
            viewer.text = Some(text);
        }
        if let Some(html) = env_viewer("MAILWATCH_VIEWER_HTML") {
            viewer.html = Some(html);
        }

        Some(Config {
            imap_server,
            imap_port,
            username,
            password,
            use_tls: !use_starttls,
            use_starttls,
            accept_invalid_certs: false,
            mailbox,
            recent_window: DEFAULT_RECENT_WINDOW,
            connect_delay: Duration::from_millis(DEFAULT_CONNECT_DELAY_MS),
            network: NetworkSource::None,
            viewer,
            spool_dir: std::env::var_os("MAILWATCH_SPOOL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        })
    }

    /// Build runtime Config from a FileConfig + resolved password string.
    pub fn from_file_config(fc: &FileConfig, password: String) -> Self {
        Config {
            imap_server: fc.server.clone(),
            imap_port: fc.port,
            username: fc.username.clone(),
            password,
            use_starttls: fc.starttls,
            use_tls: fc.tls,
            accept_invalid_certs: fc.accept_invalid_certs,
            mailbox: fc.mailbox.clone(),
            recent_window: fc.recent_window,
            connect_delay: Duration::from_millis(fc.connect_delay_ms),
            network: fc.network.clone(),
            viewer: fc.viewer.clone(),
            spool_dir: fc.spool_dir.clone().unwrap_or_else(std::env::temp_dir),
        }
    }

    /// Resolution order: env vars → config file + keyring.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        // 1. Env vars override everything
        if let Some(config) = Self::from_env() {
            log::info!("Config loaded from environment variables");
            return Ok(config);
        }

        // 2. Config file + keyring
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        match FileConfig::load(&path) {
            Ok(Some(fc)) => match &fc.password {
                PasswordBackend::Plaintext { value } => {
                    log::info!("Config loaded from {} (plaintext password)", path.display());
                    Ok(Self::from_file_config(&fc, value.clone()))
                }
                PasswordBackend::Keyring => match keyring::get_password(&fc.username, &fc.server) {
                    Ok(pw) => {
                        log::info!("Config loaded from {} + keyring", path.display());
                        Ok(Self::from_file_config(&fc, pw))
                    }
                    Err(e) => {
                        log::warn!("Keyring lookup failed: {}", e);
                        Err(ConfigError::PasswordUnavailable {
                            server: fc.server,
                            username: fc.username,
                            error: e,
                        })
                    }
                },
            },
            Ok(None) => {
                log::info!("No config file at {}", path.display());
                Err(ConfigError::Missing(path))
            }
            Err(e) => {
                log::warn!("Config file error: {}", e);
                Err(ConfigError::Invalid(e))
            }
        }
    }
}
