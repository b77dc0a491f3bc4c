//! Service configuration loaded from environment variables.
//!
//! Every setting has a safe default. Values that are present but cannot be
//! parsed fall back to the default instead of aborting startup.

use std::time::Duration;

use crate::errors::ConfigError;

const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_POLL_INTERVAL: f64 = 0.5;
const DEFAULT_MIN_POLL_INTERVAL: f64 = 0.01;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database location (`:memory:` or a file path).
    pub database_url: String,
    /// Deployment environment name.
    pub app_env: String,
    /// HTTP port the server binds to.
    pub service_port: u16,
    /// Log every SQL statement at debug level.
    pub db_echo: bool,

    /// Raw OpenAI API key; validated by [`Config::require_openai_api_key`].
    pub openai_api_key: Option<String>,
    /// Chat completion model used for evaluations.
    pub openai_model: String,

    /// Number of background evaluation workers.
    pub worker_concurrency: usize,
    /// Number of LLM samples drawn per criterion.
    pub evaluation_samples: usize,

    /// Default long-poll timeout in seconds.
    pub long_polling_default_timeout: u64,
    /// Poll interval in seconds between job re-reads.
    pub long_polling_poll_interval: f64,
    /// Lower bound in seconds for the adaptive poll interval.
    pub long_polling_min_poll_interval: f64,
    /// Maximum concurrent long-poll sessions per client.
    pub long_polling_max_client_connections: usize,
    /// Maximum concurrent long-poll sessions across all clients.
    pub long_polling_global_max_connections: usize,
    /// Rate-limit sliding window in seconds.
    pub long_polling_rate_limit_interval: u64,
    /// Requests allowed per client within the rate-limit window.
    pub long_polling_rate_limit_requests: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: ":memory:".to_string(),
            app_env: "development".to_string(),
            service_port: 8000,
            db_echo: false,
            openai_api_key: None,
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            worker_concurrency: 4,
            evaluation_samples: 5,
            long_polling_default_timeout: 30,
            long_polling_poll_interval: DEFAULT_POLL_INTERVAL,
            long_polling_min_poll_interval: DEFAULT_MIN_POLL_INTERVAL,
            long_polling_max_client_connections: 5,
            long_polling_global_max_connections: 1000,
            long_polling_rate_limit_interval: 60,
            long_polling_rate_limit_requests: 100,
        }
    }
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Tests use this to avoid mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = EnvReader { lookup };

        let openai_model = env
            .string("OPENAI_MODEL")
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or(defaults.openai_model);

        Self {
            database_url: env.string("DATABASE_URL").unwrap_or(defaults.database_url),
            app_env: env.string("APP_ENV").unwrap_or(defaults.app_env),
            service_port: env.parsed("SERVICE_PORT", defaults.service_port),
            db_echo: env
                .string("DB_ECHO")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.db_echo),
            openai_api_key: env.string("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()),
            openai_model,
            worker_concurrency: env.parsed("WORKER_CONCURRENCY", defaults.worker_concurrency),
            evaluation_samples: env.parsed("EVALUATION_SAMPLES", defaults.evaluation_samples),
            long_polling_default_timeout: env.parsed(
                "LONG_POLLING_DEFAULT_TIMEOUT",
                defaults.long_polling_default_timeout,
            ),
            long_polling_poll_interval: env.positive(
                "LONG_POLLING_POLL_INTERVAL",
                defaults.long_polling_poll_interval,
            ),
            long_polling_min_poll_interval: env.positive(
                "LONG_POLLING_MIN_POLL_INTERVAL",
                defaults.long_polling_min_poll_interval,
            ),
            long_polling_max_client_connections: env.parsed(
                "LONG_POLLING_MAX_CLIENT_CONNECTIONS",
                defaults.long_polling_max_client_connections,
            ),
            long_polling_global_max_connections: env.parsed(
                "LONG_POLLING_GLOBAL_MAX_CONNECTIONS",
                defaults.long_polling_global_max_connections,
            ),
            long_polling_rate_limit_interval: env.parsed(
                "LONG_POLLING_RATE_LIMIT_INTERVAL",
                defaults.long_polling_rate_limit_interval,
            ),
            long_polling_rate_limit_requests: env.parsed(
                "LONG_POLLING_RATE_LIMIT_REQUESTS",
                defaults.long_polling_rate_limit_requests,
            ),
        }
    }

    /// The validated OpenAI API key.
    pub fn require_openai_api_key(&self) -> Result<&str, ConfigError> {
        match self.openai_api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ConfigError::MissingApiKey),
        }
    }

    /// Settings consumed by the long-poll loop and connection manager.
    pub fn polling_settings(&self) -> PollingSettings {
        PollingSettings {
            default_timeout: self.long_polling_default_timeout,
            poll_interval: interval(
                "long_polling_poll_interval",
                self.long_polling_poll_interval,
                DEFAULT_POLL_INTERVAL,
            ),
            min_poll_interval: interval(
                "long_polling_min_poll_interval",
                self.long_polling_min_poll_interval,
                DEFAULT_MIN_POLL_INTERVAL,
            ),
            max_client_connections: self.long_polling_max_client_connections,
            global_max_connections: self.long_polling_global_max_connections,
        }
    }

    /// Settings consumed by the sliding-window rate limiter.
    pub fn rate_limit_settings(&self) -> RateLimitSettings {
        RateLimitSettings {
            window: Duration::from_secs(self.long_polling_rate_limit_interval),
            max_requests: self.long_polling_rate_limit_requests,
        }
    }
}

/// Long-poll tuning handed to the polling core.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollingSettings {
    /// Timeout in seconds used when the caller supplies none.
    pub default_timeout: u64,
    /// Cadence far from the deadline.
    pub poll_interval: Duration,
    /// Floor applied as the deadline approaches.
    pub min_poll_interval: Duration,
    pub max_client_connections: usize,
    pub global_max_connections: usize,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Config::default().polling_settings()
    }
}

/// Sliding-window rate limiter tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_requests: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Config::default().rate_limit_settings()
    }
}

/// Parse a boolean flag the way the environment conventionally spells it.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// A strictly positive interval; anything else falls back to `default`.
fn interval(name: &str, value: f64, default: f64) -> Duration {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) if !duration.is_zero() => duration,
        _ => {
            tracing::warn!("Ignoring non-positive {}: {}; using {}s", name, value, default);
            Duration::from_secs_f64(default)
        }
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        match (self.lookup)(key) {
            Some(raw) => match raw.trim().parse() {
                Ok(value) => value,
                Err(_) => {
                    tracing::warn!("Ignoring unparsable value for {}: {:?}", key, raw);
                    default
                }
            },
            None => default,
        }
    }

    fn positive(&self, key: &str, default: f64) -> f64 {
        let value = self.parsed(key, default);
        if value.is_finite() && value > 0.0 {
            value
        } else {
            tracing::warn!("Ignoring non-positive value for {}: {}", key, value);
            default
        }
    }
}
