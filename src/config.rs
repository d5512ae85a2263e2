//! Scheduler configuration.
//!
//! Every tunable of the batching engine, the worker pool and the outbound
//! HTTP clients lives in [`SchedulerConfig`]. Values start from defaults and
//! can be overridden from the environment (see [`SchedulerConfig::from_env`]).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Relative dispatch weight of premium versus free batches at the admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityRatio {
    pub premium: u32,
    pub free: u32,
}

impl Default for PriorityRatio {
    fn default() -> Self {
        Self {
            premium: 3,
            free: 1,
        }
    }
}

impl fmt::Display for PriorityRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.premium, self.free)
    }
}

impl FromStr for PriorityRatio {
    type Err = String;

    /// Parses `"<premium>:<free>"`, e.g. `"3:1"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (premium, free) = s
            .split_once(':')
            .ok_or_else(|| format!("expected '<premium>:<free>', got '{}'", s))?;
        let premium = premium
            .trim()
            .parse()
            .map_err(|_| format!("invalid premium weight '{}'", premium))?;
        let free = free
            .trim()
            .parse()
            .map_err(|_| format!("invalid free weight '{}'", free))?;
        Ok(Self { premium, free })
    }
}

/// Configuration for the scheduler service.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    // Queue store
    /// Redis connection URL.
    pub redis_url: String,

    // Compute backend
    /// Base URL of the downstream compute service.
    pub backend_url: String,
    /// Optional bearer token for the compute service.
    pub backend_api_key: Option<String>,
    /// Timeout of a single `/process_batch` call.
    pub backend_timeout: Duration,
    /// Maximum number of batches in flight against the backend.
    pub max_concurrent_batches: usize,

    // Batching
    /// A batch closes as soon as it holds this many tasks.
    pub max_batch_size: usize,
    /// A non-empty batch closes once its collection window is this old.
    pub max_batch_wait: Duration,
    /// Sleep between polls of an empty queue.
    pub idle_backoff: Duration,
    /// Premium:free weighting applied at the admission gate.
    pub priority_ratio: PriorityRatio,

    // Dispatch retries
    /// Total attempts for one batch before it is dead-lettered.
    pub max_batch_retries: u32,
    /// Backoff before the second dispatch attempt; doubles afterwards.
    pub dispatch_backoff: Duration,
    /// Upper bound for the dispatch backoff.
    pub dispatch_backoff_max: Duration,

    // Callbacks
    /// Total delivery attempts per callback.
    pub callback_max_attempts: u32,
    /// Backoff before the second delivery attempt; doubles afterwards.
    pub callback_backoff: Duration,
    /// Timeout of a single callback request.
    pub callback_timeout: Duration,

    // Worker pool
    /// Workers started with the pool.
    pub initial_workers: usize,
    /// Lower bound accepted by operator resizes.
    pub min_workers: usize,
    /// Upper bound accepted by operator resizes.
    pub max_workers: usize,
    /// How long a removed worker may take to finish its story.
    pub worker_grace_period: Duration,
    /// Decomposition attempts per story before it is dead-lettered.
    pub story_max_attempts: u32,

    // Operator surface
    /// Listen address of the operator HTTP API.
    pub bind_addr: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),

            backend_url: "http://localhost:8000".to_string(),
            backend_api_key: None,
            backend_timeout: Duration::from_secs(120),
            max_concurrent_batches: 1,

            max_batch_size: 10,
            max_batch_wait: Duration::from_secs(5),
            idle_backoff: Duration::from_millis(100),
            priority_ratio: PriorityRatio::default(),

            max_batch_retries: 3,
            dispatch_backoff: Duration::from_millis(500),
            dispatch_backoff_max: Duration::from_secs(8),

            callback_max_attempts: 3,
            callback_backoff: Duration::from_millis(500),
            callback_timeout: Duration::from_secs(10),

            initial_workers: 5,
            min_workers: 1,
            max_workers: 20,
            worker_grace_period: Duration::from_secs(60),
            story_max_attempts: 3,

            bind_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`, or `REDIS_HOST` / `REDIS_PORT` / `REDIS_PASSWORD`
    /// - `GPU_SERVICE_URL`, `GPU_API_KEY`, `BACKEND_TIMEOUT_SECS`,
    ///   `MAX_CONCURRENT_BATCHES`
    /// - `BATCH_SIZE`, `BATCH_TIMEOUT_MS`, `IDLE_BACKOFF_MS`, `PRIORITY_RATIO`
    /// - `DISPATCH_MAX_RETRIES`, `DISPATCH_BACKOFF_MS`, `DISPATCH_BACKOFF_MAX_MS`
    /// - `CALLBACK_MAX_ATTEMPTS`, `CALLBACK_BACKOFF_MS`, `CALLBACK_TIMEOUT_SECS`
    /// - `WORKERS_INITIAL`, `WORKERS_MIN`, `WORKERS_MAX`, `WORKER_GRACE_SECS`,
    ///   `STORY_MAX_ATTEMPTS`
    /// - `BIND_ADDR`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Queue store
        if let Some(url) = lookup("REDIS_URL") {
            config.redis_url = url;
        } else if let Some(host) = lookup("REDIS_HOST") {
            let port: u16 = match lookup("REDIS_PORT") {
                Some(val) => parse_env_value(&val, "REDIS_PORT")?,
                None => 6379,
            };
            config.redis_url = match lookup("REDIS_PASSWORD") {
                Some(password) if !password.is_empty() => {
                    format!("redis://:{}@{}:{}", password, host, port)
                }
                _ => format!("redis://{}:{}", host, port),
            };
        }

        // Compute backend
        if let Some(val) = lookup("GPU_SERVICE_URL") {
            config.backend_url = val;
        }
        config.backend_api_key = lookup("GPU_API_KEY").filter(|key| !key.is_empty());
        if let Some(val) = lookup("BACKEND_TIMEOUT_SECS") {
            config.backend_timeout =
                Duration::from_secs(parse_env_value(&val, "BACKEND_TIMEOUT_SECS")?);
        }
        if let Some(val) = lookup("MAX_CONCURRENT_BATCHES") {
            config.max_concurrent_batches = parse_env_value(&val, "MAX_CONCURRENT_BATCHES")?;
        }

        // Batching
        if let Some(val) = lookup("BATCH_SIZE") {
            config.max_batch_size = parse_env_value(&val, "BATCH_SIZE")?;
        }
        if let Some(val) = lookup("BATCH_TIMEOUT_MS") {
            config.max_batch_wait = Duration::from_millis(parse_env_value(&val, "BATCH_TIMEOUT_MS")?);
        }
        if let Some(val) = lookup("IDLE_BACKOFF_MS") {
            config.idle_backoff = Duration::from_millis(parse_env_value(&val, "IDLE_BACKOFF_MS")?);
        }
        if let Some(val) = lookup("PRIORITY_RATIO") {
            config.priority_ratio = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "PRIORITY_RATIO".to_string(),
                message,
            })?;
        }

        // Dispatch retries
        if let Some(val) = lookup("DISPATCH_MAX_RETRIES") {
            config.max_batch_retries = parse_env_value(&val, "DISPATCH_MAX_RETRIES")?;
        }
        if let Some(val) = lookup("DISPATCH_BACKOFF_MS") {
            config.dispatch_backoff =
                Duration::from_millis(parse_env_value(&val, "DISPATCH_BACKOFF_MS")?);
        }
        if let Some(val) = lookup("DISPATCH_BACKOFF_MAX_MS") {
            config.dispatch_backoff_max =
                Duration::from_millis(parse_env_value(&val, "DISPATCH_BACKOFF_MAX_MS")?);
        }

        // Callbacks
        if let Some(val) = lookup("CALLBACK_MAX_ATTEMPTS") {
            config.callback_max_attempts = parse_env_value(&val, "CALLBACK_MAX_ATTEMPTS")?;
        }
        if let Some(val) = lookup("CALLBACK_BACKOFF_MS") {
            config.callback_backoff =
                Duration::from_millis(parse_env_value(&val, "CALLBACK_BACKOFF_MS")?);
        }
        if let Some(val) = lookup("CALLBACK_TIMEOUT_SECS") {
            config.callback_timeout =
                Duration::from_secs(parse_env_value(&val, "CALLBACK_TIMEOUT_SECS")?);
        }

        // Worker pool
        if let Some(val) = lookup("WORKERS_INITIAL") {
            config.initial_workers = parse_env_value(&val, "WORKERS_INITIAL")?;
        }
        if let Some(val) = lookup("WORKERS_MIN") {
            config.min_workers = parse_env_value(&val, "WORKERS_MIN")?;
        }
        if let Some(val) = lookup("WORKERS_MAX") {
            config.max_workers = parse_env_value(&val, "WORKERS_MAX")?;
        }
        if let Some(val) = lookup("WORKER_GRACE_SECS") {
            config.worker_grace_period =
                Duration::from_secs(parse_env_value(&val, "WORKER_GRACE_SECS")?);
        }
        if let Some(val) = lookup("STORY_MAX_ATTEMPTS") {
            config.story_max_attempts = parse_env_value(&val, "STORY_MAX_ATTEMPTS")?;
        }

        if let Some(val) = lookup("BIND_ADDR") {
            config.bind_addr = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.backend_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "backend_url cannot be empty".to_string(),
            ));
        }

        if self.max_concurrent_batches == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_batches must be greater than 0".to_string(),
            ));
        }

        if self.max_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.max_batch_wait.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "max_batch_wait must be greater than 0".to_string(),
            ));
        }

        if self.idle_backoff.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "idle_backoff must be greater than 0".to_string(),
            ));
        }

        if self.priority_ratio.premium == 0 || self.priority_ratio.free == 0 {
            return Err(ConfigError::ValidationFailed(
                "priority_ratio weights must both be greater than 0".to_string(),
            ));
        }

        if self.max_batch_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_batch_retries must be greater than 0".to_string(),
            ));
        }

        if self.callback_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "callback_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.story_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "story_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.min_workers > self.max_workers {
            return Err(ConfigError::ValidationFailed(
                "min_workers cannot exceed max_workers".to_string(),
            ));
        }

        if !(self.min_workers..=self.max_workers).contains(&self.initial_workers) {
            return Err(ConfigError::ValidationFailed(format!(
                "initial_workers must be between {} and {}",
                self.min_workers, self.max_workers
            )));
        }

        Ok(())
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the compute backend URL.
    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = url.into();
        self
    }

    /// Builder method to set the batch size and collection window.
    pub fn with_batching(mut self, max_batch_size: usize, max_batch_wait: Duration) -> Self {
        self.max_batch_size = max_batch_size;
        self.max_batch_wait = max_batch_wait;
        self
    }

    /// Builder method to set the idle poll backoff.
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Builder method to set the premium:free ratio.
    pub fn with_priority_ratio(mut self, premium: u32, free: u32) -> Self {
        self.priority_ratio = PriorityRatio { premium, free };
        self
    }

    /// Builder method to set the backend concurrency limit.
    pub fn with_max_concurrent_batches(mut self, max: usize) -> Self {
        self.max_concurrent_batches = max;
        self
    }

    /// Builder method to set dispatch retry policy.
    pub fn with_dispatch_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.max_batch_retries = attempts;
        self.dispatch_backoff = backoff;
        self
    }

    /// Builder method to set callback retry policy.
    pub fn with_callback_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.callback_max_attempts = attempts;
        self.callback_backoff = backoff;
        self
    }

    /// Builder method to set worker pool bounds.
    pub fn with_workers(mut self, initial: usize, min: usize, max: usize) -> Self {
        self.initial_workers = initial;
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Builder method to set the worker removal grace period.
    pub fn with_worker_grace_period(mut self, grace: Duration) -> Self {
        self.worker_grace_period = grace;
        self
    }

    /// Builder method to set story decomposition attempts.
    pub fn with_story_max_attempts(mut self, attempts: u32) -> Self {
        self.story_max_attempts = attempts;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.max_batch_wait, Duration::from_secs(5));
        assert_eq!(config.priority_ratio, PriorityRatio { premium: 3, free: 1 });
        assert_eq!(config.initial_workers, 5);
        assert_eq!(config.max_workers, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars_overrides() {
        let config = SchedulerConfig::from_vars(vars(&[
            ("REDIS_HOST", "cache"),
            ("REDIS_PORT", "6380"),
            ("REDIS_PASSWORD", "secret"),
            ("GPU_SERVICE_URL", "http://gpu:9000"),
            ("GPU_API_KEY", "token"),
            ("BATCH_SIZE", "4"),
            ("BATCH_TIMEOUT_MS", "250"),
            ("PRIORITY_RATIO", "5:2"),
            ("WORKERS_INITIAL", "2"),
        ]))
        .expect("config should load");

        assert_eq!(config.redis_url, "redis://:secret@cache:6380");
        assert_eq!(config.backend_url, "http://gpu:9000");
        assert_eq!(config.backend_api_key.as_deref(), Some("token"));
        assert_eq!(config.max_batch_size, 4);
        assert_eq!(config.max_batch_wait, Duration::from_millis(250));
        assert_eq!(config.priority_ratio, PriorityRatio { premium: 5, free: 2 });
        assert_eq!(config.initial_workers, 2);
    }

    #[test]
    fn test_redis_url_takes_precedence() {
        let config = SchedulerConfig::from_vars(vars(&[
            ("REDIS_URL", "redis://primary:6379/2"),
            ("REDIS_HOST", "ignored"),
        ]))
        .expect("config should load");
        assert_eq!(config.redis_url, "redis://primary:6379/2");
    }

    #[test]
    fn test_invalid_value_is_reported() {
        let err = SchedulerConfig::from_vars(vars(&[("BATCH_SIZE", "ten")])).unwrap_err();
        assert!(err.to_string().contains("BATCH_SIZE"));

        let err = SchedulerConfig::from_vars(vars(&[("PRIORITY_RATIO", "3")])).unwrap_err();
        assert!(err.to_string().contains("PRIORITY_RATIO"));
    }

    #[test]
    fn test_validation_rejects_zero_batch_size() {
        let config = SchedulerConfig::default().with_batching(0, Duration::from_secs(1));
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("max_batch_size"));
    }

    #[test]
    fn test_validation_rejects_zero_weight() {
        let config = SchedulerConfig::default().with_priority_ratio(3, 0);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("priority_ratio"));
    }

    #[test]
    fn test_validation_rejects_initial_outside_bounds() {
        let config = SchedulerConfig::default().with_workers(30, 1, 20);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("initial_workers"));

        let config = SchedulerConfig::default().with_workers(5, 10, 2);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("min_workers"));
    }

    #[test]
    fn test_priority_ratio_parse_and_display() {
        let ratio: PriorityRatio = " 4 : 1 ".trim().parse().expect("ratio should parse");
        assert_eq!(ratio, PriorityRatio { premium: 4, free: 1 });
        assert_eq!(ratio.to_string(), "4:1");
        assert!("x:1".parse::<PriorityRatio>().is_err());
    }
}
