use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_CATALOG_URL: &str = "https://api.nasa.gov/neo/rest/v1/feed";

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Catalog API key cannot be empty")]
    EmptyApiKey,

    #[error("Table name is not a plain SQL identifier: {0}")]
    InvalidTableName(String),

    #[error("max_concurrent_lookups cannot be 0")]
    ZeroConcurrency,

    #[error("lookup_deadline_secs cannot be 0")]
    ZeroDeadline,

    #[error("max_connections cannot be 0")]
    ZeroConnections,

    #[error("Invalid value for environment variable {name}: {value}")]
    InvalidEnvironment { name: &'static str, value: String },
}

/// Count service configuration.
///
/// Built once at startup and handed to every component; nothing reads the
/// environment after construction.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for the count API
    #[serde(default)]
    pub listener: Listener,
    /// Optional listener for health and readiness probes
    #[serde(default)]
    pub admin_listener: Option<Listener>,
    /// External object catalog
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Durable storage for written counts
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Validates the service configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        if let Some(admin) = &self.admin_listener {
            admin.validate()?;
        }
        self.catalog.validate()?;
        self.store.validate()
    }

    /// Applies the environment variables understood by the service on top of
    /// the file configuration. `lookup` resolves a variable name to its value.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("NEO_LISTEN_HOST") {
            self.listener.host = host;
        }
        if let Some(port) = lookup("NEO_LISTEN_PORT") {
            self.listener.port = parse_env("NEO_LISTEN_PORT", port)?;
        }
        if let Some(api_key) = lookup("NASA_API_KEY") {
            self.catalog.api_key = api_key;
        }

        let StoreConfig::Postgres(postgres) = &mut self.store else {
            return Ok(());
        };
        if let Some(host) = lookup("DB_HOST") {
            postgres.host = host;
        }
        if let Some(port) = lookup("DB_PORT") {
            postgres.port = parse_env("DB_PORT", port)?;
        }
        if let Some(database) = lookup("DB_NAME") {
            postgres.database = database;
        }
        if let Some(table) = lookup("DB_TABLE") {
            postgres.table = table;
        }
        if let Some(user) = lookup("DB_USER") {
            postgres.user = user;
        }
        if let Some(password) = lookup("DB_PASSWORD") {
            postgres.password = password;
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ValidationError> {
    value
        .parse()
        .map_err(|_| ValidationError::InvalidEnvironment { name, value })
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// External object catalog the per-date counts are fetched from
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CatalogConfig {
    /// Feed endpoint, queried with `start_date`, `end_date`, `detailed` and `api_key`
    pub url: Url,
    pub api_key: String,
    /// Caps how many lookups of one request are in flight at once.
    /// Unset means one concurrent lookup per requested date.
    pub max_concurrent_lookups: Option<usize>,
    /// Cancels the lookups of a read request still outstanding after this many seconds.
    pub lookup_deadline_secs: Option<u64>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            url: Url::parse(DEFAULT_CATALOG_URL).expect("default catalog url is valid"),
            api_key: "DEMO_KEY".into(),
            max_concurrent_lookups: None,
            lookup_deadline_secs: None,
        }
    }
}

impl CatalogConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.api_key.is_empty() {
            return Err(ValidationError::EmptyApiKey);
        }
        if self.max_concurrent_lookups == Some(0) {
            return Err(ValidationError::ZeroConcurrency);
        }
        if self.lookup_deadline_secs == Some(0) {
            return Err(ValidationError::ZeroDeadline);
        }
        Ok(())
    }

    pub fn lookup_deadline(&self) -> Option<Duration> {
        self.lookup_deadline_secs.map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StoreConfig {
    Postgres(PostgresConfig),
    /// Process-local map, lost on restart
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Postgres(PostgresConfig::default())
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            StoreConfig::Postgres(postgres) => postgres.validate(),
            StoreConfig::Memory => Ok(()),
        }
    }
}

#[derive(Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    /// Table holding one row per date, unique on `date`
    pub table: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        PostgresConfig {
            host: "localhost".into(),
            port: 5432,
            database: "asteroids".into(),
            table: "neo_count".into(),
            user: "postgres".into(),
            password: String::new(),
            max_connections: 5,
        }
    }
}

impl PostgresConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if self.max_connections == 0 {
            return Err(ValidationError::ZeroConnections);
        }
        if !is_identifier(&self.table) {
            return Err(ValidationError::InvalidTableName(self.table.clone()));
        }
        Ok(())
    }
}

// Keeps the password out of logs
impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("table", &self.table)
            .field("user", &self.user)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

/// The table name is interpolated into SQL, so only `[A-Za-z_][A-Za-z0-9_]*` is allowed.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_parse_valid_config() {
        let yaml = r#"
listener:
    host: "127.0.0.1"
    port: 3000
admin_listener:
    host: "127.0.0.1"
    port: 3001
catalog:
    url: "http://catalog.internal/neo/rest/v1/feed"
    api_key: secret
    max_concurrent_lookups: 8
    lookup_deadline_secs: 10
store:
    type: postgres
    host: db.internal
    database: neo
    table: daily_counts
    user: neo
    password: hunter2
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.listener.port, 3000);
        assert_eq!(config.admin_listener.unwrap().port, 3001);
        assert_eq!(
            config.catalog.url.as_str(),
            "http://catalog.internal/neo/rest/v1/feed"
        );
        assert_eq!(config.catalog.max_concurrent_lookups, Some(8));
        assert_eq!(
            config.catalog.lookup_deadline(),
            Some(Duration::from_secs(10))
        );

        let StoreConfig::Postgres(postgres) = config.store else {
            panic!("expected postgres store");
        };
        assert_eq!(postgres.host, "db.internal");
        // Unset fields fall back to defaults
        assert_eq!(postgres.port, 5432);
        assert_eq!(postgres.max_connections, 5);
        assert_eq!(postgres.table, "daily_counts");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.catalog.url.as_str(), DEFAULT_CATALOG_URL);
        assert_eq!(config.catalog.max_concurrent_lookups, None);
        assert!(config.admin_listener.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_memory_store() {
        let config: Config = serde_yaml::from_str("store:\n    type: memory\n").unwrap();
        assert_eq!(config.store, StoreConfig::Memory);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_overrides(env(&[
                ("NEO_LISTEN_PORT", "9090"),
                ("NASA_API_KEY", "from-env"),
                ("DB_HOST", "pg"),
                ("DB_PORT", "6543"),
                ("DB_NAME", "space"),
                ("DB_TABLE", "counts"),
                ("DB_USER", "neo"),
                ("DB_PASSWORD", "pw"),
            ]))
            .unwrap();

        assert_eq!(config.listener.port, 9090);
        assert_eq!(config.catalog.api_key, "from-env");
        let StoreConfig::Postgres(postgres) = &config.store else {
            panic!("expected postgres store");
        };
        assert_eq!(postgres.host, "pg");
        assert_eq!(postgres.port, 6543);
        assert_eq!(postgres.database, "space");
        assert_eq!(postgres.table, "counts");
        assert_eq!(postgres.user, "neo");
        assert_eq!(postgres.password, "pw");
    }

    #[test]
    fn test_env_override_invalid_port() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(env(&[("DB_PORT", "five")]));
        assert_eq!(
            result,
            Err(ValidationError::InvalidEnvironment {
                name: "DB_PORT",
                value: "five".into()
            })
        );
    }

    #[test]
    fn test_env_db_vars_ignored_for_memory_store() {
        let mut config = Config {
            store: StoreConfig::Memory,
            ..Default::default()
        };
        config
            .apply_env_overrides(env(&[("DB_PORT", "five")]))
            .unwrap();
        assert_eq!(config.store, StoreConfig::Memory);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.listener.port = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));

        let mut config = Config::default();
        config.catalog.api_key.clear();
        assert_eq!(config.validate(), Err(ValidationError::EmptyApiKey));

        let mut config = Config::default();
        config.catalog.max_concurrent_lookups = Some(0);
        assert_eq!(config.validate(), Err(ValidationError::ZeroConcurrency));

        let mut config = Config::default();
        config.catalog.lookup_deadline_secs = Some(0);
        assert_eq!(config.validate(), Err(ValidationError::ZeroDeadline));

        let mut config = Config::default();
        if let StoreConfig::Postgres(postgres) = &mut config.store {
            postgres.table = "neo_count; DROP TABLE neo_count".into();
        }
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidTableName(_))
        ));
    }

    #[test]
    fn test_debug_hides_password() {
        let postgres = PostgresConfig {
            password: "hunter2".into(),
            ..Default::default()
        };
        assert!(!format!("{postgres:?}").contains("hunter2"));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("neo_count"));
        assert!(is_identifier("_counts2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2counts"));
        assert!(!is_identifier("public.neo_count"));
    }
}
