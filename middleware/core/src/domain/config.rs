// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

// Middleware Configuration Types
//
// Defines the configuration manifest for the middleware daemon:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Listener, frame size and send queue settings
// - Job pool sizing, retention and abort escalation
// - Audit sink, rate-limit classes and circuit breaker
// - Static users and API keys for the built-in directory
// - Observability and database settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const API_VERSION: &str = "middleware/v1";
pub const KIND: &str = "MiddlewareConfig";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level Kubernetes-style middleware configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// API version (must be "middleware/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "MiddlewareConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: MiddlewareSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiddlewareSpec {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    /// Rate-limit class table: `class -> budget`
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitClass>,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// WebSocket listener port (0 disables)
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,

    /// Raw line-delimited TCP listener
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,

    #[serde(default = "default_unix_socket")]
    pub unix_socket: PathBuf,

    /// Per-session bounded send queue (frames)
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Frame size limit before the session authenticates
    #[serde(default = "default_unauthenticated_max_frame_bytes")]
    pub unauthenticated_max_frame_bytes: usize,

    /// Default call timeout when the caller does not provide one (0 = none)
    #[serde(default)]
    pub call_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            websocket_port: default_websocket_port(),
            tcp_port: None,
            unix_socket: default_unix_socket(),
            send_queue: default_send_queue(),
            max_frame_bytes: default_max_frame_bytes(),
            unauthenticated_max_frame_bytes: default_unauthenticated_max_frame_bytes(),
            call_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directory scanned for plugin manifests (`*.yaml`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    /// Plugin names that are never set up
    #[serde(default)]
    pub disabled: Vec<String>,

    /// Root directory `etc.generate` renders into
    #[serde(default = "default_etc_root")]
    pub etc_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Global worker pool size for jobs without a lock key
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Retention of terminal transient jobs
    #[serde(default = "default_transient_retention")]
    pub transient_retention_secs: u64,

    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    /// How long an aborted job may ignore cancellation before its task is dropped
    #[serde(default = "default_abort_grace")]
    pub abort_grace_secs: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_dir: Option<PathBuf>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            transient_retention_secs: default_transient_retention(),
            max_jobs: default_max_jobs(),
            abort_grace_secs: default_abort_grace(),
            logs_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// JSON-lines file; in-memory only when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Size of the in-memory ring served by `audit.query`
    #[serde(default = "default_memory_records")]
    pub memory_records: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            flush_interval_ms: default_flush_interval(),
            memory_records: default_memory_records(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitClass {
    pub calls: u32,
    pub per_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive INTERNAL failures within the window that open the breaker
    #[serde(default = "default_breaker_failures")]
    pub failures: u32,

    #[serde(default = "default_breaker_window")]
    pub window_secs: u64,

    #[serde(default = "default_breaker_cooldown")]
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failures: default_breaker_failures(),
            window_secs: default_breaker_window(),
            cooldown_secs: default_breaker_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    #[serde(default)]
    pub users: Vec<UserEntry>,

    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl(),
            users: Vec::new(),
            api_keys: Vec::new(),
        }
    }
}

/// Static user of the built-in directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub uid: u32,
    /// `pbkdf2-sha256:<iterations>:<salt-hex>:<key-hex>`
    pub password_hash: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Hex-encoded TOTP secret; enables two-factor login when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otp_secret: Option<String>,
    #[serde(default)]
    pub locked: bool,
}

/// API key stored in SCRAM form. The raw key never appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub id: u64,
    pub name: String,
    pub username: String,
    /// Base64 salt
    pub salt: String,
    pub iterations: u32,
    /// Base64 `H(HMAC(SaltedKey, "Client Key"))`
    pub stored_key: String,
    /// Base64 `HMAC(SaltedKey, "Server Key")`
    pub server_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prometheus exporter port; disabled when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_websocket_port() -> u16 {
    6000
}

fn default_unix_socket() -> PathBuf {
    PathBuf::from("/var/run/middleware/middlewared.sock")
}

fn default_send_queue() -> usize {
    1024
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_unauthenticated_max_frame_bytes() -> usize {
    8 * 1024
}

fn default_etc_root() -> PathBuf {
    PathBuf::from("/etc")
}

fn default_workers() -> usize {
    16
}

fn default_transient_retention() -> u64 {
    600
}

fn default_max_jobs() -> usize {
    1000
}

fn default_abort_grace() -> u64 {
    5
}

fn default_flush_interval() -> u64 {
    1000
}

fn default_memory_records() -> usize {
    10_000
}

fn default_breaker_failures() -> u32 {
    5
}

fn default_breaker_window() -> u64 {
    60
}

fn default_breaker_cooldown() -> u64 {
    30
}

fn default_token_ttl() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "middlewared".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: MiddlewareSpec::default(),
        }
    }
}

impl MiddlewareConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Discover configuration file using precedence order
    /// 1. MIDDLEWARED_CONFIG_PATH environment variable
    /// 2. ./middlewared.yaml (working directory)
    /// 3. ~/.middlewared/config.yaml (user home)
    /// 4. /etc/middlewared/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("MIDDLEWARED_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./middlewared.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".middlewared").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/middlewared/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        // An explicit path must exist and parse.
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(config_path) => {
                tracing::info!("Loading configuration from discovered path: {:?}", config_path);
                Self::from_yaml_file(config_path)?
            }
            None => {
                tracing::warn!("No configuration file found in standard locations. Using defaults.");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `MIDDLEWARED_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MIDDLEWARED_UNIX_SOCKET") {
            tracing::info!("Environment override: MIDDLEWARED_UNIX_SOCKET={}", val);
            self.spec.server.unix_socket = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("MIDDLEWARED_WEBSOCKET_PORT") {
            match val.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Environment override: MIDDLEWARED_WEBSOCKET_PORT={}", port);
                    self.spec.server.websocket_port = port;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for MIDDLEWARED_WEBSOCKET_PORT: '{}'. Expected a port number. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("MIDDLEWARED_PLUGIN_DIR") {
            tracing::info!("Environment override: MIDDLEWARED_PLUGIN_DIR={}", val);
            self.spec.plugins.directory = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("MIDDLEWARED_DATABASE_URL") {
            tracing::info!("Environment override: MIDDLEWARED_DATABASE_URL set");
            match &mut self.spec.database {
                Some(database) => database.url = val,
                None => {
                    self.spec.database = Some(DatabaseConfig {
                        url: val,
                        max_connections: default_max_connections(),
                    })
                }
            }
        }

        if let Ok(val) = std::env::var("MIDDLEWARED_LOG_FORMAT") {
            match val.to_lowercase().as_str() {
                "json" | "text" => self.spec.observability.log_format = val.to_lowercase(),
                _ => tracing::warn!(
                    "Invalid value for MIDDLEWARED_LOG_FORMAT: '{}'. Expected json/text. Ignoring.",
                    val
                ),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.api_version != API_VERSION {
            return invalid(format!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version, API_VERSION
            ));
        }

        if self.kind != KIND {
            return invalid(format!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND));
        }

        if self.metadata.name.is_empty() {
            return invalid("metadata.name cannot be empty".to_string());
        }

        let server = &self.spec.server;
        if server.send_queue == 0 {
            return invalid("spec.server.send_queue must be positive".to_string());
        }
        if server.unauthenticated_max_frame_bytes > server.max_frame_bytes {
            return invalid(
                "spec.server.unauthenticated_max_frame_bytes cannot exceed max_frame_bytes".to_string(),
            );
        }

        if self.spec.jobs.workers == 0 {
            return invalid("spec.jobs.workers must be positive".to_string());
        }
        if self.spec.jobs.max_jobs == 0 {
            return invalid("spec.jobs.max_jobs must be positive".to_string());
        }

        if self.spec.audit.flush_interval_ms == 0 || self.spec.audit.flush_interval_ms > 5000 {
            return invalid("spec.audit.flush_interval_ms must be within 1..=5000".to_string());
        }

        for (class, budget) in &self.spec.rate_limits {
            if budget.calls == 0 || budget.per_seconds == 0 {
                return invalid(format!("Rate limit class '{}' needs a positive budget", class));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for user in &self.spec.auth.users {
            if user.username.is_empty() {
                return invalid("Static user name cannot be empty".to_string());
            }
            if !seen.insert(user.username.as_str()) {
                return invalid(format!("Duplicate static user '{}'", user.username));
            }
        }

        for key in &self.spec.auth.api_keys {
            if !self.spec.auth.users.iter().any(|u| u.username == key.username) && key.username != "root" {
                return invalid(format!("API key '{}' belongs to unknown user '{}'", key.name, key.username));
            }
        }

        if !matches!(self.spec.observability.log_format.as_str(), "text" | "json") {
            return invalid(format!(
                "Invalid log_format: '{}'. Must be 'text' or 'json'",
                self.spec.observability.log_format
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = MiddlewareConfig::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert_eq!(manifest.spec.jobs.transient_retention_secs, 600);
        assert_eq!(manifest.spec.jobs.max_jobs, 1000);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
apiVersion: middleware/v1
kind: MiddlewareConfig
metadata:
  name: nas-01
spec:
  server:
    websocket_port: 6001
    unix_socket: /tmp/mw.sock
  jobs:
    workers: 4
    transient_retention_secs: 60
  rate_limits:
    auth:
      calls: 20
      per_seconds: 60
  auth:
    users:
      - username: admin
        uid: 950
        password_hash: "pbkdf2-sha256:1000:00:00"
        roles: [FULL_ADMIN]
"#;
        let manifest = MiddlewareConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.metadata.name, "nas-01");
        assert_eq!(manifest.spec.server.websocket_port, 6001);
        assert_eq!(manifest.spec.server.send_queue, 1024);
        assert_eq!(manifest.spec.jobs.workers, 4);
        assert_eq!(
            manifest.spec.rate_limits.get("auth"),
            Some(&RateLimitClass { calls: 20, per_seconds: 60 })
        );
        assert_eq!(manifest.spec.auth.users[0].roles, vec!["FULL_ADMIN"]);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut manifest = MiddlewareConfig::default();
        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());

        let mut manifest = MiddlewareConfig::default();
        manifest.spec.audit.flush_interval_ms = 10_000;
        assert!(manifest.validate().is_err());

        let mut manifest = MiddlewareConfig::default();
        manifest.spec.rate_limits.insert(
            "zero".to_string(),
            RateLimitClass { calls: 0, per_seconds: 1 },
        );
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("middlewared.yaml");
        let manifest = MiddlewareConfig::default();
        manifest.to_yaml_file(&path).unwrap();
        let loaded = MiddlewareConfig::from_yaml_file(&path).unwrap();
        assert_eq!(loaded.spec.server.send_queue, manifest.spec.server.send_queue);
    }
}
