//! Server configuration from environment variables

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,
    pub bind_address: String,
    /// Public origin of the web app, used to build checkout and email links
    pub app_base_url: String,
    pub allowed_origins: Vec<String>,
}

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_APP_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let database_max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "DATABASE_MAX_CONNECTIONS",
                value: raw,
            })?,
            Err(_) => 10,
        };

        let run_migrations = std::env::var("RUN_MIGRATIONS")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            database_max_connections,
            run_migrations,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string()),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_APP_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            allowed_origins,
        })
    }

    /// Configuration for tests and local tooling that never touch the database
    pub fn for_base_url(app_base_url: &str) -> Self {
        Self {
            database_url: String::new(),
            database_max_connections: 1,
            run_migrations: false,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            app_base_url: app_base_url.trim_end_matches('/').to_string(),
            allowed_origins: vec![app_base_url.to_string()],
        }
    }
}
