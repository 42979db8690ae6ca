//! Retrigger scheduling policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Schedule for automatically created retrigger steps
///
/// When a step fails and its catalog entry defines an on-failure retrigger,
/// the new step is created immediately but becomes visible to workers only
/// after the delay this policy computes. Jitter spreads retriggers of many
/// processes failing against the same downstream service.
///
/// # Example
///
/// ```
/// use process_engine::RetriggerPolicy;
/// use std::time::Duration;
///
/// let policy = RetriggerPolicy::exponential()
///     .with_max_retriggers(5)
///     .with_initial_delay(Duration::from_secs(30));
///
/// // First retrigger after ~30 seconds, second after ~60, and so on.
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetriggerPolicy {
    /// Maximum number of automatic retriggers per failed-step lineage
    ///
    /// Past this bound the process stalls and waits for an operator.
    pub max_retriggers: u32,

    /// Delay before the first retrigger becomes visible
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound on the computed delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Multiplier applied per retrigger (e.g. 2.0 for doubling)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0), fraction of the delay randomized
    pub jitter: f64,
}

impl Default for RetriggerPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetriggerPolicy {
    /// Exponential backoff with sensible defaults: 3 retriggers, 30 second
    /// initial delay, 10 minute cap, doubling, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_retriggers: 3,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Retrigger immediately, without delay
    pub fn immediate(max_retriggers: u32) -> Self {
        Self {
            max_retriggers,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Fixed delay between retriggers
    pub fn fixed(delay: Duration, max_retriggers: u32) -> Self {
        Self {
            max_retriggers,
            initial_delay: delay,
            max_delay: delay,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the retrigger bound
    pub fn with_max_retriggers(mut self, max_retriggers: u32) -> Self {
        self.max_retriggers = max_retriggers;
        self
    }

    /// Set the initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether the given retrigger attempt (1-based) is still allowed
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_retriggers
    }

    /// Delay before the given retrigger attempt (1-based) becomes visible
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1);
        let base =
            self.initial_delay.as_secs_f64() * self.backoff_coefficient.powi(exponent as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.jitter;
            let offset = rng.gen_range(-range..range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetriggerPolicy::exponential();
        assert_eq!(policy.max_retriggers, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(30));
        assert_eq!(policy.backoff_coefficient, 2.0);
    }

    #[test]
    fn test_immediate_has_no_delay() {
        let policy = RetriggerPolicy::immediate(2);
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::ZERO);
    }

    #[test]
    fn test_exponential_growth() {
        let policy = RetriggerPolicy::exponential()
            .with_initial_delay(Duration::from_secs(10))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for(3), Duration::from_secs(40));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetriggerPolicy::exponential()
            .with_initial_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(25))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for(10), Duration::from_secs(25));
    }

    #[test]
    fn test_allows_bound() {
        let policy = RetriggerPolicy::exponential().with_max_retriggers(2);
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetriggerPolicy::fixed(Duration::from_secs(5), 4);
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let policy = RetriggerPolicy::fixed(Duration::from_secs(7), 9);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetriggerPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
