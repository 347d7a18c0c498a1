use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const AUTH_COOKIE_NAME: &str = "viewer_auth";
pub const MAX_CHATS_PAGE: u32 = 1000;
pub const MAX_MESSAGES_PAGE: u32 = 200;
pub const SESSION_SWEEP_INTERVAL_SECS: u64 = 900;
pub const MASSOP_RELEASE_TICK_MS: u64 = 500;

/// Top-level config (chatvault.toml + CHATVAULT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatvaultConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub mass_op: MassOpConfig,
    /// Master-level scope filter; `None` means unrestricted.
    #[serde(default)]
    pub display_chat_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub push_notifications: PushMode,
    #[serde(default = "default_timezone")]
    pub viewer_timezone: String,
    #[serde(default = "default_stats_hour")]
    pub stats_calculation_hour: u8,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ChatvaultConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            media: MediaConfig::default(),
            auth: AuthConfig::default(),
            push: PushConfig::default(),
            mass_op: MassOpConfig::default(),
            display_chat_ids: None,
            push_notifications: PushMode::default(),
            viewer_timezone: default_timezone(),
            stats_calculation_hour: default_stats_hour(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl ChatvaultConfig {
    /// Load from `path` (if present) merged with `CHATVAULT_`-prefixed
    /// environment variables, falling back to built-in defaults on any
    /// parse failure. Loading never aborts startup.
    pub fn load(path: &str) -> Self {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CHATVAULT_").split("_"))
            .extract()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "config load failed, using defaults");
                Self::default()
            })
    }

    pub fn auth_session_seconds(&self) -> i64 {
        self.auth.session_days as i64 * 86_400
    }

    pub fn display_chat_ids_set(&self) -> Option<std::collections::HashSet<i64>> {
        self.display_chat_ids
            .as_ref()
            .map(|ids| ids.iter().copied().collect())
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_stats_hour() -> u8 {
    3
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Embedded,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,
    /// Path to the embedded single-file database.
    #[serde(default = "default_storage_path")]
    pub path: String,
    /// Connection string for the server-based backend.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            path: default_storage_path(),
            url: None,
        }
    }
}

fn default_storage_path() -> String {
    "./data/archive.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_media_root")]
    pub root: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: default_media_root(),
        }
    }
}

fn default_media_root() -> String {
    "./data/media".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecureCookies {
    #[default]
    Auto,
    True,
    False,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_session_days")]
    pub session_days: u32,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_rate_window_s")]
    pub rate_window_s: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_user: usize,
    #[serde(default)]
    pub secure_cookies: SecureCookies,
    #[serde(default = "default_master_username")]
    pub master_username: String,
    /// Plaintext master password from configuration. Compared with
    /// constant-time equality, never hashed (it is not stored).
    #[serde(default)]
    pub master_password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_days: default_session_days(),
            rate_limit: default_rate_limit(),
            rate_window_s: default_rate_window_s(),
            max_sessions_per_user: default_max_sessions(),
            secure_cookies: SecureCookies::default(),
            master_username: default_master_username(),
            master_password: String::new(),
        }
    }
}

fn default_session_days() -> u32 {
    30
}

fn default_rate_limit() -> u32 {
    15
}

fn default_rate_window_s() -> u64 {
    300
}

fn default_max_sessions() -> usize {
    10
}

fn default_master_username() -> String {
    "admin".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PushMode {
    #[default]
    Off,
    Basic,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PushConfig {
    pub vapid_public_key: Option<String>,
    pub vapid_private_key: Option<String>,
    pub vapid_subject: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MassOpConfig {
    #[serde(default = "default_mass_op_threshold")]
    pub threshold: usize,
    #[serde(default = "default_mass_op_window_s")]
    pub window_s: u64,
    #[serde(default = "default_mass_op_buffer_delay_s")]
    pub buffer_delay_s: f64,
}

impl Default for MassOpConfig {
    fn default() -> Self {
        Self {
            threshold: default_mass_op_threshold(),
            window_s: default_mass_op_window_s(),
            buffer_delay_s: default_mass_op_buffer_delay_s(),
        }
    }
}

fn default_mass_op_threshold() -> usize {
    10
}

fn default_mass_op_window_s() -> u64 {
    30
}

fn default_mass_op_buffer_delay_s() -> f64 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ChatvaultConfig::default();
        assert_eq!(cfg.auth.rate_limit, 15);
        assert_eq!(cfg.auth.rate_window_s, 300);
        assert_eq!(cfg.auth.max_sessions_per_user, 10);
        assert_eq!(cfg.auth_session_seconds(), 30 * 86_400);
        assert_eq!(cfg.mass_op.threshold, 10);
        assert_eq!(cfg.mass_op.window_s, 30);
        assert_eq!(cfg.mass_op.buffer_delay_s, 2.0);
        assert_eq!(cfg.stats_calculation_hour, 3);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = ChatvaultConfig::load("/nonexistent/path/chatvault.toml");
        assert_eq!(cfg.server.port, DEFAULT_PORT);
    }
}
