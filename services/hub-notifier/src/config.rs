//! Configuration types for the hub notifier service

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HubError, Result};

/// Hub notifier service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub leads: Option<LeadsConfig>,
}

impl Config {
    /// Replace `*_env` references with the values of those environment variables
    pub fn resolve_secrets(&mut self) -> Result<()> {
        self.auth.resolve_secrets()
    }
}

/// Push channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_hub_path")]
    pub hub_path: String,
    /// Connect straight to the WebSocket endpoint without `/negotiate`
    #[serde(default)]
    pub skip_negotiation: bool,
    /// Upper bound on transport open + negotiation + hub handshake
    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub connection_timeout: Duration,
    #[serde(default = "default_keep_alive_interval", with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    /// Silence from the server longer than this counts as a dropped connection
    #[serde(default = "default_server_timeout", with = "humantime_serde")]
    pub server_timeout: Duration,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Server invocation names that are turned into notifications
    #[serde(default = "default_notification_targets")]
    pub notification_targets: Vec<String>,
    /// Groups joined after every successful (re)connect
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            hub_path: default_hub_path(),
            skip_negotiation: false,
            connection_timeout: default_connection_timeout(),
            keep_alive_interval: default_keep_alive_interval(),
            server_timeout: default_server_timeout(),
            reconnect: ReconnectConfig::default(),
            notification_targets: default_notification_targets(),
            groups: Vec::new(),
        }
    }
}

impl HubConfig {
    /// Full hub URL, e.g. `https://backend.example.com/purchaseOrderHub`
    pub fn hub_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if self.hub_path.is_empty() {
            base.to_string()
        } else if self.hub_path.starts_with('/') {
            format!("{}{}", base, self.hub_path)
        } else {
            format!("{}/{}", base, self.hub_path)
        }
    }

    /// Check settings that serde defaults cannot guard
    pub fn validate(&self) -> Result<()> {
        let url = self.hub_url();
        let scheme_ok = ["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| url.starts_with(scheme));
        if !scheme_ok {
            return Err(HubError::Config(format!(
                "Hub URL must use http, https, ws or wss: {}",
                url
            )));
        }
        if self.reconnect.enabled && self.reconnect.retry_delays_ms.is_empty() {
            return Err(HubError::Config(
                "reconnect.retry_delays_ms must not be empty when reconnect is enabled"
                    .to_string(),
            ));
        }
        if self.keep_alive_interval >= self.server_timeout {
            return Err(HubError::Config(format!(
                "keep_alive_interval ({:?}) must be shorter than server_timeout ({:?})",
                self.keep_alive_interval, self.server_timeout
            )));
        }
        Ok(())
    }
}

/// Configuration for automatic reconnection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection when an established connection drops
    #[serde(default = "default_reconnect_enabled")]
    pub enabled: bool,
    /// Delay before each attempt; the last value repeats once exhausted
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,
    /// Maximum number of reconnection attempts (None for unlimited)
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconnect_enabled(),
            retry_delays_ms: default_retry_delays_ms(),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given 1-based reconnection attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let millis = self
            .retry_delays_ms
            .get(index)
            .or_else(|| self.retry_delays_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(millis)
    }

    /// Whether the given 1-based attempt is within `max_attempts`
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

/// Where bearer tokens for the push channel come from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// Connect without a token
    #[default]
    None,
    /// Fixed bearer token
    Static {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        token_env: Option<String>,
    },
    /// OAuth 2.0 refresh-token grant with device-code fallback
    #[serde(rename = "oauth")]
    OAuth {
        /// e.g. `https://login.microsoftonline.com/<tenant>`
        authority: String,
        client_id: String,
        #[serde(default)]
        scopes: Vec<String>,
        #[serde(default)]
        refresh_token: Option<String>,
        #[serde(default)]
        refresh_token_env: Option<String>,
    },
}

impl AuthConfig {
    fn resolve_secrets(&mut self) -> Result<()> {
        match self {
            AuthConfig::None => Ok(()),
            AuthConfig::Static { token, token_env } => {
                if let Some(var) = token_env.take() {
                    *token = Some(read_env(&var)?);
                }
                Ok(())
            }
            AuthConfig::OAuth {
                refresh_token,
                refresh_token_env,
                ..
            } => {
                if let Some(var) = refresh_token_env.take() {
                    *refresh_token = Some(read_env(&var)?);
                }
                Ok(())
            }
        }
    }
}

fn read_env(var: &str) -> Result<String> {
    std::env::var(var).map_err(|e| {
        HubError::Config(format!("Failed to read environment variable {}: {}", var, e))
    })
}

/// Backend API used for actions taken on a notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadsConfig {
    pub api_base_url: String,
}

fn default_base_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_hub_path() -> String {
    "/purchaseOrderHub".to_string()
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_keep_alive_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_server_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_reconnect_enabled() -> bool {
    true
}

fn default_retry_delays_ms() -> Vec<u64> {
    vec![0, 2000, 10000, 30000]
}

fn default_notification_targets() -> Vec<String> {
    vec![crate::notification::PURCHASE_ORDER_TAG.to_string()]
}

/// Load configuration from a JSON file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        HubError::Config(format!("Failed to read config file {:?}: {}", path, e))
    })?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}
