use std::time::Duration;

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Result;
use crate::event::EventPattern;
use crate::step::StepContext;

/// A durable function: a body of named steps started by matching events.
///
/// The body is replayed from the top on every invocation. Steps that already
/// succeeded return their memoized result, so the body must reach its steps in
/// a deterministic order for a given input.
pub trait QuillFunction: Send + Sync + 'static {
    /// Input, deserialized from the triggering event's `data`.
    type Input: DeserializeOwned + Send;
    /// Output stored on the completed run.
    type Output: Serialize + Send;

    /// Function metadata.
    fn info(&self) -> FunctionInfo;

    /// Execute the body.
    fn execute<'a>(
        &'a self,
        ctx: &'a StepContext,
        input: Self::Input,
    ) -> BoxFuture<'a, Result<Self::Output>>;
}

/// Function metadata.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    /// Unique function id.
    pub id: &'static str,
    /// Human-readable name.
    pub name: &'static str,
    /// Event names that start a run.
    pub trigger: EventPattern,
    /// Optional cap on simultaneously running runs.
    pub concurrency: Option<ConcurrencyConfig>,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Upper bound on a single invocation.
    pub timeout: Duration,
}

impl FunctionInfo {
    /// Create metadata with default retry and timeout.
    pub fn new(id: &'static str, trigger: impl Into<EventPattern>) -> Self {
        Self {
            id,
            name: id,
            trigger: trigger.into(),
            concurrency: None,
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(900),
        }
    }

    /// Set the display name.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Limit simultaneously running runs, optionally per key.
    pub fn concurrency(mut self, limit: u32, key: Option<&str>) -> Self {
        self.concurrency = Some(ConcurrencyConfig {
            limit,
            key: key.map(str::to_string),
        });
        self
    }

    /// Set the retry configuration.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the invocation timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl From<String> for EventPattern {
    fn from(s: String) -> Self {
        EventPattern::new(s)
    }
}

/// Concurrency limit for a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum runs in the `Running` state at once.
    pub limit: u32,
    /// JSON pointer into the event data (`/user_id`) scoping the limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ConcurrencyConfig {
    /// Resolve the scoping key against event data.
    ///
    /// Returns `None` when no key is configured or the pointer is absent, in
    /// which case the limit applies function-wide.
    pub fn resolve_key(&self, data: &serde_json::Value) -> Option<String> {
        let pointer = self.key.as_deref()?;
        match data.pointer(pointer)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Delay of the first retry.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Maximum backoff duration.
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    /// Create an exponential policy with the given attempt budget.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Calculate backoff duration after the given failed attempt (1-based).
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay;
        let backoff = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(attempt.max(1)),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        };
        backoff.min(self.max_backoff)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay each time.
    Fixed,
    /// Delay increases linearly.
    Linear,
    /// Delay doubles each time.
    #[default]
    Exponential,
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exponential_backoff() {
        let config = RetryConfig::default();
        assert_eq!(config.calculate_backoff(1), Duration::from_secs(1));
        assert_eq!(config.calculate_backoff(2), Duration::from_secs(2));
        assert_eq!(config.calculate_backoff(3), Duration::from_secs(4));
        assert_eq!(config.calculate_backoff(4), Duration::from_secs(8));
    }

    #[test]
    fn test_max_backoff_cap() {
        let config = RetryConfig {
            max_backoff: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(config.calculate_backoff(10), Duration::from_secs(10));
        assert_eq!(config.calculate_backoff(64), Duration::from_secs(10));
    }

    #[test]
    fn test_linear_and_fixed() {
        let linear = RetryConfig {
            backoff: BackoffStrategy::Linear,
            ..Default::default()
        };
        assert_eq!(linear.calculate_backoff(3), Duration::from_secs(3));

        let fixed = RetryConfig {
            backoff: BackoffStrategy::Fixed,
            ..Default::default()
        };
        assert_eq!(fixed.calculate_backoff(5), Duration::from_secs(1));
    }

    #[test]
    fn test_allows_retry() {
        let config = RetryConfig::attempts(3);
        assert!(config.allows_retry(1));
        assert!(config.allows_retry(2));
        assert!(!config.allows_retry(3));
        assert_eq!(RetryConfig::attempts(0).max_attempts, 1);
    }

    #[test]
    fn test_concurrency_key_resolution() {
        let config = ConcurrencyConfig {
            limit: 1,
            key: Some("/user_id".into()),
        };
        assert_eq!(
            config.resolve_key(&json!({"user_id": "u-1"})),
            Some("u-1".to_string())
        );
        assert_eq!(
            config.resolve_key(&json!({"user_id": 42})),
            Some("42".to_string())
        );
        assert_eq!(config.resolve_key(&json!({})), None);

        let unkeyed = ConcurrencyConfig {
            limit: 2,
            key: None,
        };
        assert_eq!(unkeyed.resolve_key(&json!({"user_id": "u-1"})), None);
    }

    #[test]
    fn test_function_info_builder() {
        let info = FunctionInfo::new("user-deletion", "users/deletion.requested")
            .named("Delete user")
            .concurrency(1, Some("/user_id"))
            .retry(RetryConfig::attempts(5));

        assert_eq!(info.id, "user-deletion");
        assert_eq!(info.name, "Delete user");
        assert!(info.trigger.matches("users/deletion.requested"));
        assert_eq!(info.concurrency.unwrap().limit, 1);
        assert_eq!(info.retry.max_attempts, 5);
    }
}
