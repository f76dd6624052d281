//! Configuration types and loading
//!
//! The configuration is a YAML file whose path is read from an environment
//! variable. String values may reference environment variables as `${NAME}`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// Environment variable holding the path of the configuration file
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 3306;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CONNECTION_LIMIT: u32 = 10;

/// Logical table name -> physical table name
pub type TableMap = BTreeMap<String, String>;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Database configuration. Absent means no pool can be created.
    #[serde(default)]
    pub db: Option<DatabaseConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database connection and pool configuration
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Database server host. Default `localhost`.
    #[serde(default = "default_host")]
    pub host: String,

    /// Database server port. Default `3306`.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Default database used when a connection is established
    pub database: String,

    pub user: String,

    pub password: String,

    /// Connect timeout in milliseconds. Default `10000`.
    #[serde(default = "default_timeout")]
    pub connect_timeout: u64,

    /// Maximum number of physical connections. Default `10`.
    #[serde(default = "default_connection_limit")]
    pub connection_limit: u32,

    /// Timeout to acquire a connection from the pool in milliseconds. Default `10000`.
    #[serde(default = "default_timeout")]
    pub acquire_timeout: u64,

    /// Logs pool lifecycle events and every rendered statement
    #[serde(default)]
    pub debug: bool,

    /// The table map between logical and physical table names
    #[serde(default)]
    pub tables: TableMap,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_connection_limit() -> u32 {
    DEFAULT_CONNECTION_LIMIT
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("connect_timeout", &self.connect_timeout)
            .field("connection_limit", &self.connection_limit)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("debug", &self.debug)
            .field("tables", &self.tables)
            .finish()
    }
}

impl DatabaseConfig {
    /// Create a config with the required fields and defaults for everything else
    pub fn new(
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            database: database.into(),
            user: user.into(),
            password: password.into(),
            connect_timeout: DEFAULT_TIMEOUT_MS,
            connection_limit: DEFAULT_CONNECTION_LIMIT,
            acquire_timeout: DEFAULT_TIMEOUT_MS,
            debug: false,
            tables: TableMap::new(),
        }
    }

    pub fn with_table(mut self, logical: impl Into<String>, physical: impl Into<String>) -> Self {
        self.tables.insert(logical.into(), physical.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout)
    }

    /// Physical table name for a logical one
    pub fn table(&self, logical: &str) -> Option<&str> {
        self.tables.get(logical).map(String::as_str)
    }

    /// Connection URL without the password, for log output
    pub fn display_url(&self) -> String {
        format!(
            "mysql://{}:***@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "db.database".into(),
                message: "must not be empty".into(),
            });
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "db.user".into(),
                message: "must not be empty".into(),
            });
        }
        if self.connection_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "db.connectionLimit".into(),
                message: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

/// Logging configuration for binaries
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment variable not set: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("Config file error: {0}")]
    FileError(String),
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}

static ENV_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)\}").expect("valid env reference pattern"));

/// Read an environment variable by its exact, upper-case or lower-case name
pub fn env_value(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    [name.to_string(), name.to_uppercase(), name.to_lowercase()]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
}

impl AppConfig {
    /// Load the configuration from the file named by the given environment variable
    pub fn from_env_path(var: &str) -> Result<Self, ConfigError> {
        let path = env_value(var).ok_or_else(|| ConfigError::MissingEnvVar(var.to_string()))?;
        Self::load(path)
    }

    /// Load the configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Could not load configuration");
            ConfigError::FileError(format!("{}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse YAML content, expanding `${NAME}` environment references
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: Value = serde_yaml::from_str(content)?;
        let config: AppConfig = serde_yaml::from_value(expand_env(raw))?;
        if let Some(db) = &config.db {
            db.validate()?;
        }
        Ok(config)
    }
}

fn expand_env(value: Value) -> Value {
    match value {
        Value::String(s) => expand_env_str(&s),
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(key, value)| (key, expand_env(value)))
                .collect(),
        ),
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(expand_env).collect()),
        other => other,
    }
}

fn expand_env_str(s: &str) -> Value {
    if !ENV_REF.is_match(s) {
        return Value::String(s.to_string());
    }
    let expanded = ENV_REF
        .replace_all(s, |caps: &regex::Captures| {
            let name = &caps[1];
            match env_value(name) {
                Some(value) => {
                    tracing::debug!(name, "Found environment variable");
                    value
                }
                None => caps[0].to_string(),
            }
        })
        .into_owned();

    // A value that is exactly one reference keeps the scalar type of the
    // substituted text, so `port: ${DB_PORT}` still reads as a number.
    let whole = ENV_REF
        .find(s)
        .map(|m| m.start() == 0 && m.end() == s.len())
        .unwrap_or(false);
    if whole && expanded != s {
        if let Ok(scalar @ (Value::Number(_) | Value::Bool(_))) =
            serde_yaml::from_str::<Value>(&expanded)
        {
            return scalar;
        }
    }
    Value::String(expanded)
}
