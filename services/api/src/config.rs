use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Output format of the tracing subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Which browser origins may call the API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CorsOrigins {
    Any,
    List(Vec<String>),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub joinly_url: String,
    pub max_agents: usize,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub log_level: Level,
    pub log_format: LogFormat,
    pub analysis_dir: Option<PathBuf>,
    pub cors_origins: CorsOrigins,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub ollama_url: String,
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_positive(name: &str, default: u64) -> Result<u64, ConfigError> {
    let Some(raw) = optional_var(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        )),
        Ok(value) => Ok(value),
        Err(e) => Err(ConfigError::InvalidValue(name.to_string(), e.to_string())),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8001".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let joinly_url = optional_var("JOINLY_URL")
            .unwrap_or_else(|| "http://localhost:8000/mcp/".to_string());
        if !joinly_url.starts_with("http://") && !joinly_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "JOINLY_URL".to_string(),
                format!("'{joinly_url}' is not an http(s) URL"),
            ));
        }

        let max_agents = parse_positive("MAX_AGENTS", 10)? as usize;
        let request_timeout = Duration::from_secs(parse_positive("REQUEST_TIMEOUT_SECS", 60)?);
        let poll_interval = Duration::from_millis(parse_positive("POLL_INTERVAL_MS", 1000)?);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let log_format = match optional_var("LOG_FORMAT")
            .unwrap_or_else(|| "text".to_string())
            .to_lowercase()
            .as_str()
        {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LOG_FORMAT".to_string(),
                    format!("'{other}' is not one of text, json"),
                ));
            }
        };

        let analysis_dir = optional_var("ANALYSIS_DIR").map(PathBuf::from);

        let origins =
            optional_var("CORS_ORIGINS").unwrap_or_else(|| "http://localhost:3000".to_string());
        let cors_origins = if origins.trim() == "*" {
            CorsOrigins::Any
        } else {
            CorsOrigins::List(
                origins
                    .split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect(),
            )
        };

        Ok(Self {
            bind_address,
            joinly_url,
            max_agents,
            request_timeout,
            poll_interval,
            log_level,
            log_format,
            analysis_dir,
            cors_origins,
            openai_api_key: optional_var("OPENAI_API_KEY"),
            anthropic_api_key: optional_var("ANTHROPIC_API_KEY"),
            google_api_key: optional_var("GOOGLE_API_KEY"),
            ollama_url: optional_var("OLLAMA_URL")
                .unwrap_or_else(|| "http://localhost:11434/v1".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tracing::Level;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("BIND_ADDRESS");
            env::remove_var("JOINLY_URL");
            env::remove_var("MAX_AGENTS");
            env::remove_var("REQUEST_TIMEOUT_SECS");
            env::remove_var("POLL_INTERVAL_MS");
            env::remove_var("RUST_LOG");
            env::remove_var("LOG_FORMAT");
            env::remove_var("ANALYSIS_DIR");
            env::remove_var("CORS_ORIGINS");
            env::remove_var("OPENAI_API_KEY");
            env::remove_var("ANTHROPIC_API_KEY");
            env::remove_var("GOOGLE_API_KEY");
            env::remove_var("OLLAMA_URL");
        }
    }

    #[test]
    fn test_config_error_display() {
        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        clear_env_vars();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:8001");
        assert_eq!(config.joinly_url, "http://localhost:8000/mcp/");
        assert_eq!(config.max_agents, 10);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.analysis_dir, None);
        assert_eq!(
            config.cors_origins,
            CorsOrigins::List(vec!["http://localhost:3000".to_string()])
        );
        assert_eq!(config.openai_api_key, None);
        assert_eq!(config.ollama_url, "http://localhost:11434/v1");
    }

    #[test]
    #[serial]
    fn test_config_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("BIND_ADDRESS", "127.0.0.1:9000");
            env::set_var("JOINLY_URL", "https://joinly.internal/mcp/");
            env::set_var("MAX_AGENTS", "3");
            env::set_var("REQUEST_TIMEOUT_SECS", "15");
            env::set_var("POLL_INTERVAL_MS", "250");
            env::set_var("RUST_LOG", "debug");
            env::set_var("LOG_FORMAT", "JSON");
            env::set_var("ANALYSIS_DIR", "/var/lib/joinly/analysis");
            env::set_var("CORS_ORIGINS", "http://a.example, http://b.example");
            env::set_var("OPENAI_API_KEY", "sk-test");
            env::set_var("ANTHROPIC_API_KEY", "");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:9000");
        assert_eq!(config.joinly_url, "https://joinly.internal/mcp/");
        assert_eq!(config.max_agents, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.analysis_dir,
            Some(PathBuf::from("/var/lib/joinly/analysis"))
        );
        assert_eq!(
            config.cors_origins,
            CorsOrigins::List(vec![
                "http://a.example".to_string(),
                "http://b.example".to_string()
            ])
        );
        assert_eq!(config.openai_api_key, Some("sk-test".to_string()));
        assert_eq!(config.anthropic_api_key, None);
    }

    #[test]
    #[serial]
    fn test_config_wildcard_cors() {
        clear_env_vars();
        unsafe {
            env::set_var("CORS_ORIGINS", "*");
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.cors_origins, CorsOrigins::Any);
    }

    #[test]
    #[serial]
    fn test_config_invalid_bind_address() {
        clear_env_vars();
        unsafe {
            env::set_var("BIND_ADDRESS", "not-a-valid-address");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "BIND_ADDRESS"),
            _ => panic!("Expected InvalidValue for BIND_ADDRESS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_zero_max_agents() {
        clear_env_vars();
        unsafe {
            env::set_var("MAX_AGENTS", "0");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, reason) => {
                assert_eq!(var, "MAX_AGENTS");
                assert!(reason.contains("greater than zero"));
            }
            _ => panic!("Expected InvalidValue for MAX_AGENTS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_format() {
        clear_env_vars();
        unsafe {
            env::set_var("LOG_FORMAT", "xml");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "LOG_FORMAT"),
            _ => panic!("Expected InvalidValue for LOG_FORMAT"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_joinly_url() {
        clear_env_vars();
        unsafe {
            env::set_var("JOINLY_URL", "localhost:8000");
        }

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::InvalidValue(var, _)) if var == "JOINLY_URL"
        ));
    }
}
