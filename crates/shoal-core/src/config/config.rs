use crate::error::ShoalError;

const DEFAULT_DATABASE_URL: &str = "sqlite://shoal.db";
const DEFAULT_TOKEN_TTL_SECONDS: u64 = 3600;
const DEFAULT_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_POOL_OVERFLOW: u32 = 10;
const MIN_SECRET_LEN: usize = 64;

/// Runtime configuration, loaded from the environment.
///
/// `JWT_SECRET_KEY` and `API_KEY` are hard requirements in every
/// environment; there is no development fallback for either.
#[derive(Debug, Clone)]
pub struct ShoalConfig {
    pub database_url: String,
    pub api_key: String,
    pub jwt_secret: String,
    /// Previous signing secret kept live across a rotation, if any.
    pub jwt_secret_previous: Option<String>,
    pub token_ttl_seconds: u64,
    pub max_connections: u32,
    pub pool_overflow: u32,
    pub websocket_host: Option<String>,
    pub websocket_port: Option<u16>,
    pub log_level: String,
    pub performance_monitoring: bool,
}

impl ShoalConfig {
    /// Load from process environment variables.
    pub fn load() -> Result<Self, ShoalError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary lookup function. Tests use this to avoid
    /// mutating process-wide environment state.
    pub fn from_lookup<F>(get: F) -> Result<Self, ShoalError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get_nonempty = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let api_key = get_nonempty("API_KEY")
            .ok_or_else(|| ShoalError::Config("API_KEY is required".into()))?;

        let jwt_secret = get_nonempty("JWT_SECRET_KEY")
            .ok_or_else(|| ShoalError::Config("JWT_SECRET_KEY is required".into()))?;
        if jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ShoalError::Config(format!(
                "JWT_SECRET_KEY must be at least {MIN_SECRET_LEN} characters"
            )));
        }

        let jwt_secret_previous = match get_nonempty("JWT_SECRET_KEY_PREVIOUS") {
            Some(prev) if prev.len() < MIN_SECRET_LEN => {
                return Err(ShoalError::Config(format!(
                    "JWT_SECRET_KEY_PREVIOUS must be at least {MIN_SECRET_LEN} characters"
                )));
            }
            other => other,
        };

        let database_url =
            get_nonempty("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let token_ttl_seconds = parse_var(&get, "TOKEN_TTL_SECONDS", DEFAULT_TOKEN_TTL_SECONDS)?;
        let max_connections = parse_var(&get, "MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        let pool_overflow = parse_var(&get, "POOL_OVERFLOW", DEFAULT_POOL_OVERFLOW)?;

        let websocket_host = get_nonempty("WEBSOCKET_HOST");
        let websocket_port = match get_nonempty("WEBSOCKET_PORT") {
            Some(raw) => Some(raw.parse::<u16>().map_err(|_| {
                ShoalError::Config(format!("WEBSOCKET_PORT is not a valid port: '{raw}'"))
            })?),
            None => None,
        };
        if websocket_host.is_some() != websocket_port.is_some() {
            return Err(ShoalError::Config(
                "WEBSOCKET_HOST and WEBSOCKET_PORT must be set together".into(),
            ));
        }

        let log_level = get_nonempty("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let performance_monitoring = get_nonempty("ENABLE_PERFORMANCE_MONITORING")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(true);

        Ok(Self {
            database_url,
            api_key,
            jwt_secret,
            jwt_secret_previous,
            token_ttl_seconds,
            max_connections,
            pool_overflow,
            websocket_host,
            websocket_port,
            log_level,
            performance_monitoring,
        })
    }

    /// Base URL of the push process the broadcast bridge posts to, when a
    /// two-process deployment is configured.
    pub fn bridge_url(&self) -> Option<String> {
        match (&self.websocket_host, self.websocket_port) {
            (Some(host), Some(port)) => Some(format!("http://{host}:{port}")),
            _ => None,
        }
    }

    /// Total pool size handed to the storage engine.
    pub fn pool_size(&self) -> u32 {
        self.max_connections + self.pool_overflow
    }
}

fn parse_var<F, T>(get: &F, key: &str, default: T) -> Result<T, ShoalError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ShoalError::Config(format!("{key} is not a valid number: '{raw}'"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn secret() -> String {
        "s".repeat(64)
    }

    fn base_vars() -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("API_KEY".to_string(), "test-api-key".to_string());
        vars.insert("JWT_SECRET_KEY".to_string(), secret());
        vars
    }

    fn load(vars: &HashMap<String, String>) -> Result<ShoalConfig, ShoalError> {
        ShoalConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_apply() {
        let cfg = load(&base_vars()).unwrap();
        assert_eq!(cfg.database_url, "sqlite://shoal.db");
        assert_eq!(cfg.token_ttl_seconds, 3600);
        assert_eq!(cfg.max_connections, 20);
        assert_eq!(cfg.pool_overflow, 10);
        assert_eq!(cfg.pool_size(), 30);
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.performance_monitoring);
        assert!(cfg.bridge_url().is_none());
    }

    #[test]
    fn missing_jwt_secret_is_a_config_error() {
        let mut vars = base_vars();
        vars.remove("JWT_SECRET_KEY");
        let err = load(&vars).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn short_jwt_secret_is_rejected() {
        let mut vars = base_vars();
        vars.insert("JWT_SECRET_KEY".to_string(), "too-short".to_string());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let mut vars = base_vars();
        vars.remove("API_KEY");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn bridge_url_requires_both_host_and_port() {
        let mut vars = base_vars();
        vars.insert("WEBSOCKET_HOST".to_string(), "127.0.0.1".to_string());
        assert!(load(&vars).is_err());

        vars.insert("WEBSOCKET_PORT".to_string(), "8765".to_string());
        let cfg = load(&vars).unwrap();
        assert_eq!(cfg.bridge_url().as_deref(), Some("http://127.0.0.1:8765"));
    }

    #[test]
    fn numeric_overrides_parse() {
        let mut vars = base_vars();
        vars.insert("TOKEN_TTL_SECONDS".to_string(), "120".to_string());
        vars.insert("MAX_CONNECTIONS".to_string(), "5".to_string());
        vars.insert("POOL_OVERFLOW".to_string(), "2".to_string());
        let cfg = load(&vars).unwrap();
        assert_eq!(cfg.token_ttl_seconds, 120);
        assert_eq!(cfg.pool_size(), 7);
    }

    #[test]
    fn bad_numeric_value_is_rejected() {
        let mut vars = base_vars();
        vars.insert("TOKEN_TTL_SECONDS".to_string(), "soon".to_string());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn performance_monitoring_flag_parses() {
        let mut vars = base_vars();
        vars.insert(
            "ENABLE_PERFORMANCE_MONITORING".to_string(),
            "false".to_string(),
        );
        assert!(!load(&vars).unwrap().performance_monitoring);
    }
}
