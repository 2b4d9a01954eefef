//! Runtime configuration
//!
//! Loaded from a YAML file with serde defaults so a partial file (or none at
//! all) yields a usable runtime.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::error::{ColonyError, Result};
use crate::state::AutonomyMode;

/// Top-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Sleep between control-loop cycles, in milliseconds
    pub loop_interval_ms: u64,
    /// Maximum unread messages drained per Observe phase
    pub observe_batch: usize,
    /// Per-step timeout for model and network calls, in milliseconds
    pub step_timeout_ms: u64,
    /// Per-agent token budget enforced by the budget ledger
    pub token_budget: u64,
    /// Maximum unpinned memories kept per agent before pruning
    pub memory_cap: usize,
    /// Whether a connected capability falls back to mock output when the
    /// real backend fails. Demo-only behavior; off in production.
    pub mock_fallback: bool,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub model: ModelConfig,
    /// Agents deployed at startup by the CLI
    pub agents: Vec<AgentSpec>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: 5_000,
            observe_batch: 10,
            step_timeout_ms: 60_000,
            token_budget: 100_000,
            memory_cap: 200,
            mock_fallback: false,
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            model: ModelConfig::default(),
            agents: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        serde_yml::from_str(&raw).map_err(|e| ColonyError::InvalidConfig {
            message: e.to_string(),
        })
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open
    pub failure_threshold: u32,
    /// How long an open breaker waits before allowing a half-open probe
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
            exponential_base: 2.0,
        }
    }

    /// Calculate delay for retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let delay = self.base_delay_ms as f64 * self.exponential_base.powi(attempt as i32 - 1);
        let delay = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }
}

/// Language-model endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key; never the key itself
    pub api_key_env: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "default".to_string(),
            api_key_env: None,
        }
    }
}

/// An agent to deploy at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub autonomy: AutonomyMode,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.observe_batch, 10);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert!(!config.mock_fallback);
    }

    #[test]
    fn test_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "loop_interval_ms: 250\ntoken_budget: 500").unwrap();

        let config = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(config.loop_interval_ms, 250);
        assert_eq!(config.token_budget, 500);
        // Unspecified fields keep their defaults
        assert_eq!(config.observe_batch, 10);
    }

    #[test]
    fn test_retry_policy_delay() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0).as_millis(), 0);
        assert_eq!(policy.delay_for_attempt(1).as_millis(), 100);
        assert_eq!(policy.delay_for_attempt(2).as_millis(), 200);
        assert_eq!(policy.delay_for_attempt(3).as_millis(), 400);
    }
}
