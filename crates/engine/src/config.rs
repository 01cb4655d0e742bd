//! Server and client configuration.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use fieldsync_core::DeviceId;

/// Limits the sync service enforces on incoming requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Largest number of deltas accepted in one push.
    pub max_push_batch: u32,
    /// Upper bound a pull `limit` is clamped to.
    pub max_pull_limit: u32,
    /// Page size used when a pull does not ask for one.
    pub default_pull_limit: u32,
    /// Largest accepted payload, in bytes of JSON text.
    pub max_payload_bytes: usize,
    /// Entity types the server accepts. Empty accepts every type.
    pub entity_types: BTreeSet<String>,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            max_push_batch: 100,
            max_pull_limit: 500,
            default_pull_limit: 100,
            max_payload_bytes: 1024 * 1024,
            entity_types: BTreeSet::new(),
        }
    }

    pub fn with_max_push_batch(mut self, size: u32) -> Self {
        self.max_push_batch = size;
        self
    }

    pub fn with_max_pull_limit(mut self, limit: u32) -> Self {
        self.max_pull_limit = limit;
        self
    }

    pub fn with_default_pull_limit(mut self, limit: u32) -> Self {
        self.default_pull_limit = limit;
        self
    }

    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    /// Restrict the server to the given entity types.
    pub fn with_entity_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn accepts_entity_type(&self, entity_type: &str) -> bool {
        self.entity_types.is_empty() || self.entity_types.contains(entity_type)
    }

    /// Clamp a requested pull limit into `[1, max_pull_limit]`.
    pub fn clamp_pull_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_pull_limit)
            .clamp(1, self.max_pull_limit.max(1))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-device sync settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub device_id: DeviceId,
    /// Most outbox entries sent in one push.
    pub push_batch_size: u32,
    /// Page size requested on pull.
    pub pull_page_size: u32,
    pub retry: RetryConfig,
}

impl ClientConfig {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            push_batch_size: 100,
            pull_page_size: 100,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_push_batch_size(mut self, size: u32) -> Self {
        self.push_batch_size = size;
        self
    }

    pub fn with_pull_page_size(mut self, size: u32) -> Self {
        self.pull_page_size = size;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DeviceId::new())
    }
}

/// Backoff for retryable transport failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the given attempt (0-indexed); the first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter && capped > 0.0 {
            let jitter = capped * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_and_limits() {
        let config = ServerConfig::default();
        assert_eq!(config.max_push_batch, 100);
        assert_eq!(config.clamp_pull_limit(None), 100);
        assert_eq!(config.clamp_pull_limit(Some(0)), 1);
        assert_eq!(config.clamp_pull_limit(Some(10_000)), 500);
        assert!(config.accepts_entity_type("anything"));

        let restricted = config.with_entity_types(["installation", "photo"]);
        assert!(restricted.accepts_entity_type("photo"));
        assert!(!restricted.accepts_entity_type("measurement"));
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(RetryConfig::no_retry().delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"max_push_batch": 10, "entity_types": ["photo"]}"#).unwrap();
        assert_eq!(config.max_push_batch, 10);
        assert_eq!(config.max_pull_limit, 500);
        assert!(!config.accepts_entity_type("installation"));

        let client: ClientConfig = serde_json::from_str(r#"{"push_batch_size": 5}"#).unwrap();
        assert_eq!(client.push_batch_size, 5);
        assert_eq!(client.retry.max_attempts, 3);
    }
}
