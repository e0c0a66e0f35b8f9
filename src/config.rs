use std::env;

/// Broker configuration. All values read from environment variables with
/// defaults suitable for local development.
///
/// Environment variables:
/// - `BIND_ADDR` — listen address (default: 0.0.0.0)
/// - `PORT` — listen port (default: 5001)
/// - `AUTH_ENABLED` — require bearer tokens on every request (default: false)
/// - `DEFAULT_TOKEN_EXPIRY_HOURS` — lifetime of issued tokens (default: 720)
/// - `MAX_CONNECTIONS` — global live-connection cap (default: 1000)
/// - `MAX_CONNECTIONS_PER_CLIENT` — per-client connection cap (default: 10)
/// - `CORS_ALLOWED_ORIGINS` — comma-separated origins (default: localhost)
/// - `RATE_LIMIT_PER_MINUTE` — token bucket capacity and refill (default: 60)
/// - `CODE_EXEC_ENABLED` — allow code execution handoff (default: false)
/// - `SANDBOX_ENDPOINT` — client_id of the sandbox collaborator (required
///   when CODE_EXEC_ENABLED=1)
/// - `LOG_LEVEL` — debug|info|warn|error (default: info)
/// - `LOG_FORMAT` — text|json (default: text)
/// - `DATA_DIR` — persistence directory (default: data)
/// - `HEARTBEAT_INTERVAL_SECONDS` — server heartbeat cadence (default: 30)
/// - `ADMIN_KEY` — bearer key for token issuance/revocation (unset = admin
///   surface disabled)
/// - `PRODUCTION` — when set, wildcard CORS origins are refused
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    pub auth_enabled: bool,
    pub default_token_expiry_hours: i64,
    pub max_connections: usize,
    pub max_connections_per_client: usize,
    pub cors_allowed_origins: Vec<String>,
    pub rate_limit_per_minute: u32,
    pub code_exec_enabled: bool,
    pub sandbox_endpoint: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
    pub data_dir: String,
    pub heartbeat_interval_secs: u64,
    pub admin_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// A fatal configuration problem. The process exits with code 1 on these.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("SANDBOX_ENDPOINT must be set when CODE_EXEC_ENABLED is true")]
    MissingSandboxEndpoint,
    #[error("wildcard CORS origin is not allowed in production")]
    WildcardCorsInProduction,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 5001,
            auth_enabled: false,
            default_token_expiry_hours: 720,
            max_connections: 1000,
            max_connections_per_client: 10,
            cors_allowed_origins: vec![
                "http://localhost".to_string(),
                "http://127.0.0.1".to_string(),
            ],
            rate_limit_per_minute: 60,
            code_exec_enabled: false,
            sandbox_endpoint: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            data_dir: "data".to_string(),
            heartbeat_interval_secs: 30,
            admin_key: None,
        }
    }
}

fn env_bool(var: &str) -> Option<bool> {
    env::var(var)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = env::var("BIND_ADDR")
            && !val.trim().is_empty()
        {
            config.bind_addr = val.trim().to_string();
        }
        if let Ok(val) = env::var("PORT") {
            config.port = val.parse().map_err(|_| ConfigError::Invalid {
                var: "PORT",
                value: val.clone(),
                reason: "not a port number",
            })?;
        }
        if let Some(b) = env_bool("AUTH_ENABLED") {
            config.auth_enabled = b;
        }
        if let Ok(val) = env::var("DEFAULT_TOKEN_EXPIRY_HOURS") {
            config.default_token_expiry_hours =
                val.parse().map_err(|_| ConfigError::Invalid {
                    var: "DEFAULT_TOKEN_EXPIRY_HOURS",
                    value: val.clone(),
                    reason: "not an integer",
                })?;
        }
        if let Ok(val) = env::var("MAX_CONNECTIONS") {
            config.max_connections = val.parse().map_err(|_| ConfigError::Invalid {
                var: "MAX_CONNECTIONS",
                value: val.clone(),
                reason: "not an integer",
            })?;
        }
        if let Ok(val) = env::var("MAX_CONNECTIONS_PER_CLIENT") {
            config.max_connections_per_client =
                val.parse().map_err(|_| ConfigError::Invalid {
                    var: "MAX_CONNECTIONS_PER_CLIENT",
                    value: val.clone(),
                    reason: "not an integer",
                })?;
        }
        if let Ok(val) = env::var("CORS_ALLOWED_ORIGINS")
            && !val.trim().is_empty()
        {
            config.cors_allowed_origins = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(val) = env::var("RATE_LIMIT_PER_MINUTE") {
            config.rate_limit_per_minute = val.parse().map_err(|_| ConfigError::Invalid {
                var: "RATE_LIMIT_PER_MINUTE",
                value: val.clone(),
                reason: "not an integer",
            })?;
        }
        if let Some(b) = env_bool("CODE_EXEC_ENABLED") {
            config.code_exec_enabled = b;
        }
        if let Ok(val) = env::var("SANDBOX_ENDPOINT")
            && !val.trim().is_empty()
        {
            config.sandbox_endpoint = Some(val.trim().to_string());
        }
        if let Ok(val) = env::var("LOG_LEVEL") {
            match val.as_str() {
                "debug" | "info" | "warn" | "error" => config.log_level = val,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "LOG_LEVEL",
                        value: val,
                        reason: "expected debug|info|warn|error",
                    });
                }
            }
        }
        if let Ok(val) = env::var("LOG_FORMAT") {
            config.log_format = match val.as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "LOG_FORMAT",
                        value: val,
                        reason: "expected text|json",
                    });
                }
            };
        }
        if let Ok(val) = env::var("DATA_DIR")
            && !val.trim().is_empty()
        {
            config.data_dir = val.trim().to_string();
        }
        if let Ok(val) = env::var("HEARTBEAT_INTERVAL_SECONDS") {
            config.heartbeat_interval_secs = val.parse().map_err(|_| ConfigError::Invalid {
                var: "HEARTBEAT_INTERVAL_SECONDS",
                value: val.clone(),
                reason: "not an integer",
            })?;
        }
        if let Ok(val) = env::var("ADMIN_KEY")
            && !val.trim().is_empty()
        {
            config.admin_key = Some(val.trim().to_string());
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.code_exec_enabled && self.sandbox_endpoint.is_none() {
            return Err(ConfigError::MissingSandboxEndpoint);
        }
        let production = env_bool("PRODUCTION").unwrap_or(false);
        if production && self.cors_allowed_origins.iter().any(|o| o == "*") {
            return Err(ConfigError::WildcardCorsInProduction);
        }
        Ok(())
    }

    /// Path of the SQLite database file inside `data_dir`.
    pub fn db_path(&self) -> String {
        format!("{}/broker.db", self.data_dir)
    }
}
