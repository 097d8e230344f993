use crate::core::{DbError, Result};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use std::time::Duration;

/// Session variable that carries the tenant for row-level security.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeConfig {
    pub schema: String,
    pub field: String,
}

impl ScopeConfig {
    pub fn new(schema: &str, field: &str) -> Self {
        Self {
            schema: schema.to_string(),
            field: field.to_string(),
        }
    }

    /// `schema.field`, as read by `current_setting`.
    pub fn variable_name(&self) -> String {
        format!("{}.{}", self.schema, self.field)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema.is_empty() {
            return Err(DbError::Config("RLS schema cannot be empty".into()));
        }
        if self.field.is_empty() {
            return Err(DbError::Config("RLS field cannot be empty".into()));
        }
        Ok(())
    }
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self::new("app", "current_organization")
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// Parse `{"username": "...", "password": "..."}`.
    pub fn from_json(value: &str) -> Result<Self> {
        serde_json::from_str(value)
            .map_err(|e| DbError::Config(format!("invalid credentials JSON: {e}")))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Option<Duration>,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            min_connections: 10,
            max_lifetime: Some(Duration::from_secs(3600)),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Server settings applied to every connection at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionDefaults {
    pub application_name: Option<String>,
    pub idle_in_transaction_session_timeout_ms: Option<u32>,
    pub statement_timeout_ms: Option<u32>,
}

impl ConnectionDefaults {
    /// `key=value` pairs in key order; unset fields are omitted.
    pub fn parameters(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(name) = &self.application_name {
            params.push(("application_name", name.clone()));
        }
        if let Some(ms) = self.idle_in_transaction_session_timeout_ms {
            params.push(("idle_in_transaction_session_timeout", ms.to_string()));
        }
        if let Some(ms) = self.statement_timeout_ms {
            params.push(("statement_timeout", ms.to_string()));
        }
        params
    }
}

/// PostgreSQL connection configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub credentials: Credentials,
    pub disable_ssl: bool,
    pub pool: PoolConfig,
    pub defaults: ConnectionDefaults,
}

impl DatabaseConfig {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            credentials: Credentials::new(username, password),
            disable_ssl: false,
            pool: PoolConfig::default(),
            defaults: ConnectionDefaults::default(),
        }
    }

    /// Set the database name
    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    /// Set the host
    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn disable_ssl(mut self, disable: bool) -> Self {
        self.disable_ssl = disable;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: u32) -> Self {
        self.pool.max_connections = max;
        self
    }

    /// Set minimum connections
    pub fn min_connections(mut self, min: u32) -> Self {
        self.pool.min_connections = min;
        self
    }

    /// Set maximum lifetime
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.pool.max_lifetime = Some(lifetime);
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.pool.acquire_timeout = timeout;
        self
    }

    pub fn application_name(mut self, name: &str) -> Self {
        self.defaults.application_name = Some(name.to_string());
        self
    }

    pub fn statement_timeout_ms(mut self, ms: u32) -> Self {
        self.defaults.statement_timeout_ms = Some(ms);
        self
    }

    pub fn idle_in_transaction_session_timeout_ms(mut self, ms: u32) -> Self {
        self.defaults.idle_in_transaction_session_timeout_ms = Some(ms);
        self
    }

    fn ssl_mode(&self) -> &'static str {
        if self.disable_ssl {
            "disable"
        } else {
            "verify-full"
        }
    }

    /// Convert to connection URL with the password masked
    pub fn to_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.credentials.username,
            "***", // Don't expose password
            self.host,
            self.port,
            self.database,
            self.ssl_mode()
        )
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(DbError::Config("host cannot be empty".into()));
        }

        if self.port == 0 {
            return Err(DbError::Config("port must be > 0".into()));
        }

        if self.database.is_empty() {
            return Err(DbError::Config("database cannot be empty".into()));
        }

        if self.credentials.username.is_empty() {
            return Err(DbError::Config("username cannot be empty".into()));
        }

        if self.credentials.password.is_empty() {
            return Err(DbError::Config("password cannot be empty".into()));
        }

        if self.pool.max_connections == 0 {
            return Err(DbError::Config("max_connections must be > 0".into()));
        }

        if self.pool.min_connections > self.pool.max_connections {
            return Err(DbError::Config(
                "min_connections cannot exceed max_connections".into(),
            ));
        }

        Ok(())
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        let ssl_mode = if self.disable_ssl {
            PgSslMode::Disable
        } else {
            PgSslMode::VerifyFull
        };

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.credentials.username)
            .password(&self.credentials.password)
            .ssl_mode(ssl_mode);

        if let Some(name) = &self.defaults.application_name {
            options = options.application_name(name);
        }

        let server_options: Vec<_> = self
            .defaults
            .parameters()
            .into_iter()
            .filter(|(key, _)| *key != "application_name")
            .collect();
        if !server_options.is_empty() {
            options = options.options(server_options);
        }

        options
    }

    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.pool.max_connections)
            .min_connections(self.pool.min_connections)
            .max_lifetime(self.pool.max_lifetime)
            .acquire_timeout(self.pool.acquire_timeout)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new("postgres", "postgres")
    }
}

/// Application configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scope: ScopeConfig,
}

impl AppConfig {
    /// Load `.env` (if present), then read `{prefix}DB_*`, `{prefix}RLS_*`
    /// and connection default variables.
    pub fn from_env(prefix: &str) -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    pub fn from_lookup(prefix: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{prefix}{name}")).filter(|v| !v.is_empty());

        let credentials = match var("DB_CREDENTIALS") {
            Some(json) => Credentials::from_json(&json)?,
            None => Credentials::new(
                &var("DB_USERNAME").unwrap_or_default(),
                &var("DB_PASSWORD").unwrap_or_default(),
            ),
        };

        let mut database = DatabaseConfig::new(&credentials.username, &credentials.password);

        if let Some(host) = var("DB_HOST") {
            database.host = host;
        }
        if let Some(port) = var("DB_PORT") {
            database.port = parse(prefix, "DB_PORT", &port)?;
        }
        if let Some(name) = var("DB_NAME") {
            database.database = name;
        }
        if let Some(flag) = var("DB_DISABLE_SSL") {
            database.disable_ssl = parse_bool(prefix, "DB_DISABLE_SSL", &flag)?;
        }
        if let Some(max) = var("DB_MAX_CONNECTIONS") {
            database.pool.max_connections = parse(prefix, "DB_MAX_CONNECTIONS", &max)?;
        }
        if let Some(min) = var("DB_MIN_CONNECTIONS") {
            database.pool.min_connections = parse(prefix, "DB_MIN_CONNECTIONS", &min)?;
        }
        if let Some(secs) = var("DB_MAX_LIFETIME_SECS") {
            let secs: u64 = parse(prefix, "DB_MAX_LIFETIME_SECS", &secs)?;
            database.pool.max_lifetime = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = var("DB_ACQUIRE_TIMEOUT_SECS") {
            let secs = parse(prefix, "DB_ACQUIRE_TIMEOUT_SECS", &secs)?;
            database.pool.acquire_timeout = Duration::from_secs(secs);
        }

        database.defaults = ConnectionDefaults {
            application_name: var("APPLICATION_NAME"),
            idle_in_transaction_session_timeout_ms: var("IDLE_IN_TRANSACTION_TIMEOUT_MS")
                .map(|ms| parse(prefix, "IDLE_IN_TRANSACTION_TIMEOUT_MS", &ms))
                .transpose()?,
            statement_timeout_ms: var("STATEMENT_TIMEOUT_MS")
                .map(|ms| parse(prefix, "STATEMENT_TIMEOUT_MS", &ms))
                .transpose()?,
        };

        let defaults = ScopeConfig::default();
        let scope = ScopeConfig {
            schema: var("RLS_SCHEMA").unwrap_or(defaults.schema),
            field: var("RLS_FIELD").unwrap_or(defaults.field),
        };

        database.validate()?;
        scope.validate()?;

        Ok(Self { database, scope })
    }
}

fn parse<T: std::str::FromStr>(prefix: &str, name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DbError::Config(format!("invalid value for {prefix}{name}: {value:?}")))
}

fn parse_bool(prefix: &str, name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(DbError::Config(format!(
            "invalid value for {prefix}{name}: {value:?}"
        ))),
    }
}
