//! Configuration management for memcache-session.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::cli::Args;
use crate::session::{
    LockScope, SessionManager, SessionOptions, DEFAULT_ID_BYTES, DEFAULT_MAX_ID_ATTEMPTS,
    DEFAULT_NAMESPACE,
};
use crate::store::MemcacheStore;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store configuration.
    pub store: StoreSection,
    /// Session behavior.
    pub session: SessionSection,
    /// Logging configuration.
    pub logging: LoggingSection,
}

/// Store configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Memcached servers, as a single address or a list.
    #[serde(deserialize_with = "one_or_many")]
    pub memcache_server: Vec<String>,
    /// Prefix for every session key.
    pub namespace: String,
    /// Client options forwarded untouched to the memcache client.
    pub options: BTreeMap<String, String>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            memcache_server: vec!["127.0.0.1:11211".to_string()],
            namespace: DEFAULT_NAMESPACE.to_string(),
            options: BTreeMap::new(),
        }
    }
}

/// Session behavior section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Lock per session or per instance.
    pub lock_scope: LockScope,
    /// Identifier generation attempts before giving up.
    pub max_id_attempts: u32,
    /// Random bytes per identifier.
    pub id_bytes: usize,
    /// Log deleted and updated keys on every save.
    pub verbose: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            lock_scope: LockScope::default(),
            max_id_attempts: DEFAULT_MAX_ID_ATTEMPTS,
            id_bytes: DEFAULT_ID_BYTES,
            verbose: false,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(server) => vec![server],
        OneOrMany::Many(servers) => servers,
    })
}

fn split_servers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(servers) = std::env::var("MEMCACHE_SESSION_SERVERS") {
            let servers = split_servers(&servers);
            if !servers.is_empty() {
                self.store.memcache_server = servers;
            }
        }

        if let Ok(namespace) = std::env::var("MEMCACHE_SESSION_NAMESPACE") {
            self.store.namespace = namespace;
        }

        if let Ok(verbose) = std::env::var("MEMCACHE_SESSION_VERBOSE") {
            self.session.verbose = matches!(verbose.as_str(), "1" | "true" | "yes");
        }

        if let Ok(level) = std::env::var("MEMCACHE_SESSION_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if !args.servers.is_empty() {
            self.store.memcache_server = args.servers.clone();
        }

        if let Some(ref namespace) = args.namespace {
            self.store.namespace = namespace.clone();
        }

        if args.verbose {
            self.session.verbose = true;
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(ref path) = args.config {
            config = Config::from_file(path)?;
        }

        config.apply_env();
        config.apply_args(args);
        config.validate()?;

        Ok(config)
    }

    /// Check values that cannot be represented in a store key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ns = &self.store.namespace;
        if ns.is_empty() || ns.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ConfigError::InvalidNamespace(ns.clone()));
        }

        if self.store.memcache_server.is_empty() {
            return Err(ConfigError::NoServers);
        }

        Ok(())
    }

    /// Options for a [`SessionManager`].
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            namespace: self.store.namespace.clone(),
            lock_scope: self.session.lock_scope,
            max_id_attempts: self.session.max_id_attempts,
            id_bytes: self.session.id_bytes,
            verbose: self.session.verbose,
        }
    }

    /// Connect to the configured memcached servers.
    pub fn session_manager(&self) -> crate::Result<SessionManager<MemcacheStore>> {
        SessionManager::connect(
            &self.store.memcache_server,
            &self.store.options,
            self.session_options(),
        )
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// Namespace unusable as a key prefix.
    InvalidNamespace(String),
    /// No memcached server configured.
    NoServers,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::InvalidNamespace(ns) => write!(f, "invalid namespace: {:?}", ns),
            Self::NoServers => write!(f, "no memcache servers configured"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.memcache_server, vec!["127.0.0.1:11211"]);
        assert_eq!(config.store.namespace, "rack:session");
        assert_eq!(config.session.lock_scope, LockScope::Session);
        assert!(!config.session.verbose);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "store": {
                "memcache_server": ["cache-a:11211", "cache-b:11211"],
                "namespace": "shop:session",
                "options": { "timeout": "0.5" }
            },
            "session": {
                "lock_scope": "instance",
                "verbose": true
            }
        }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.store.memcache_server.len(), 2);
        assert_eq!(config.store.namespace, "shop:session");
        assert_eq!(config.store.options.get("timeout").unwrap(), "0.5");
        assert_eq!(config.session.lock_scope, LockScope::Instance);
        assert!(config.session.verbose);
        assert_eq!(config.session.max_id_attempts, DEFAULT_MAX_ID_ATTEMPTS);
    }

    #[test]
    fn test_single_server_string() {
        let json = r#"{ "store": { "memcache_server": "10.0.0.5:11211" } }"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.store.memcache_server, vec!["10.0.0.5:11211"]);
        assert_eq!(config.store.namespace, "rack:session"); // Default
    }

    #[test]
    fn test_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        let args = Args {
            servers: vec!["cache:11211".to_string()],
            namespace: Some("api".to_string()),
            verbose: true,
            log_level: Some("debug".to_string()),
            ..Args::default()
        };

        config.apply_args(&args);

        assert_eq!(config.store.memcache_server, vec!["cache:11211"]);
        assert_eq!(config.store.namespace, "api");
        assert!(config.session.verbose);
        assert_eq!(config.log_filter(), "debug");
    }

    #[test]
    fn test_apply_empty_args_keeps_servers() {
        let mut config = Config::default();
        config.apply_args(&Args::default());
        assert_eq!(config.store.memcache_server, vec!["127.0.0.1:11211"]);
    }

    #[test]
    fn test_validate_namespace() {
        let mut config = Config::default();
        config.store.namespace = "has space".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidNamespace(_))
        ));

        config.store.namespace = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_servers() {
        let mut config = Config::default();
        config.store.memcache_server.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoServers)));
    }

    #[test]
    fn test_split_servers() {
        assert_eq!(
            split_servers("a:11211, b:11211,,"),
            vec!["a:11211".to_string(), "b:11211".to_string()]
        );
        assert!(split_servers(" ").is_empty());
    }

    #[test]
    fn test_session_options() {
        let mut config = Config::default();
        config.store.namespace = "app".to_string();
        config.session.max_id_attempts = 4;

        let opts = config.session_options();
        assert_eq!(opts.namespace, "app");
        assert_eq!(opts.max_id_attempts, 4);
        assert_eq!(opts.lock_scope, LockScope::Session);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"memcache_server\""));
        assert!(json.contains("\"namespace\""));
    }
}
