use std::time::Duration;

use crate::backend::RetryPolicy;

const DEFAULT_PORT: u16 = 8081;
const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

/// Client configuration loaded from environment variables.
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub backend_url: String,
    pub retry: RetryPolicy,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("PORT").ok().as_deref(),
            std::env::var("SENTRY_DSN").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
            std::env::var("BACKEND_URL").ok().as_deref(),
            std::env::var("RETRY_ATTEMPTS").ok().as_deref(),
            std::env::var("RETRY_INTERVAL_MS").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        port: Option<&str>,
        sentry_dsn: Option<&str>,
        environment: Option<&str>,
        backend_url: Option<&str>,
        retry_attempts: Option<&str>,
        retry_interval_ms: Option<&str>,
    ) -> Self {
        let port = port.and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);

        let sentry_dsn = sentry_dsn.filter(|s| !s.is_empty()).map(String::from);

        let environment = environment
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| "local".to_string());

        let backend_url = backend_url
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_BACKEND_URL)
            .trim_end_matches('/')
            .to_string();

        let defaults = RetryPolicy::default();
        let attempts = retry_attempts
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.attempts);
        let interval = retry_interval_ms
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.interval);

        Config {
            port,
            sentry_dsn,
            environment,
            backend_url,
            retry: RetryPolicy::new(attempts, interval),
        }
    }
}
