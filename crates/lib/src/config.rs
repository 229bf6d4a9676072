//! Client configuration: gateway URL, auth token, handshake identity, reconnect bounds.
//!
//! Loaded from a JSON file (e.g. `~/.gateway-client/config.json`) and environment.
//! Every field is optional in the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::{DEFAULT_MAX_DELAY, DEFAULT_MIN_DELAY};
use crate::protocol::{ClientInfo, ConnectAuth, ConnectParams, PROTOCOL_VERSION};

/// Env var that overrides `token`.
pub const TOKEN_ENV: &str = "GATEWAY_TOKEN";
/// Env var that overrides the config file path.
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CLIENT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Gateway WebSocket URL (default `ws://127.0.0.1:15151/ws`).
    #[serde(default = "default_url")]
    pub url: String,

    /// Opaque auth token sent with `connect`. Overridden by GATEWAY_TOKEN env.
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Identity announced in the handshake.
    #[serde(default)]
    pub client: ClientInfo,

    #[serde(default = "default_role")]
    pub role: String,

    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    #[serde(default)]
    pub caps: Vec<String>,

    #[serde(default = "default_protocol")]
    pub min_protocol: u32,

    #[serde(default = "default_protocol")]
    pub max_protocol: u32,
}

/// Reconnect delay bounds in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_url() -> String {
    "ws://127.0.0.1:15151/ws".to_string()
}

fn default_role() -> String {
    ConnectParams::default().role
}

fn default_scopes() -> Vec<String> {
    ConnectParams::default().scopes
}

fn default_protocol() -> u32 {
    PROTOCOL_VERSION
}

fn default_min_delay_ms() -> u64 {
    DEFAULT_MIN_DELAY.as_millis() as u64
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY.as_millis() as u64
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    /// Never below `min_delay`.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: None,
            reconnect: ReconnectConfig::default(),
            client: ClientInfo::default(),
            role: default_role(),
            scopes: default_scopes(),
            caps: Vec::new(),
            min_protocol: default_protocol(),
            max_protocol: default_protocol(),
        }
    }
}

impl ClientConfig {
    /// Handshake params with the resolved token.
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            min_protocol: self.min_protocol,
            max_protocol: self.max_protocol,
            client: self.client.clone(),
            caps: self.caps.clone(),
            role: self.role.clone(),
            scopes: self.scopes.clone(),
            auth: ConnectAuth {
                token: resolve_token(self),
            },
        }
    }
}

/// Resolve the auth token: env GATEWAY_TOKEN overrides config. Blank values count as unset.
pub fn resolve_token(config: &ClientConfig) -> Option<String> {
    std::env::var(TOKEN_ENV)
        .ok()
        .and_then(|s| non_blank(&s))
        .or_else(|| config.token.as_deref().and_then(non_blank))
}

fn non_blank(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".gateway-client").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path. Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(ClientConfig, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        ClientConfig::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s).with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Write `{}` to `path` if it does not exist yet, creating the parent directory.
/// Returns true when a file was written.
pub fn init_config(path: &Path) -> Result<bool> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating config directory {}", dir.display()))?;
    if path.exists() {
        log::debug!("config already exists at {}, skipping", path.display());
        return Ok(false);
    }
    std::fs::write(path, b"{}")
        .with_context(|| format!("writing default config to {}", path.display()))?;
    log::info!("created default config at {}", path.display());
    Ok(true)
}
