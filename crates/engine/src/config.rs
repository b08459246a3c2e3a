//! Engine configuration.
//!
//! Every knob has a default; a config file only needs the fields it wants
//! to override.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Symptom matcher weights
    pub matcher: MatcherWeights,
    /// Evidence likelihood multipliers
    pub likelihood: LikelihoodConfig,
    /// Belief at or above which a cause is Confirmed
    pub confirmation_threshold: f64,
    /// Belief below which a cause is Refuted
    pub refutation_floor: f64,
    /// Probe worker pool size, shared across sessions
    pub workers: usize,
    /// Probe retry policy
    pub retry: RetryConfig,
    /// Remediation verification polling
    pub verification: VerificationConfig,
    /// Wall-clock timeout for a single remediation or rollback command
    pub action_timeout_secs: u64,
    /// Session wall-clock TTL before auto-escalation
    pub session_ttl_secs: u64,
    /// Approval gating policy
    pub approval: ApprovalPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherWeights::default(),
            likelihood: LikelihoodConfig::default(),
            confirmation_threshold: 0.7,
            refutation_floor: 0.05,
            workers: 8,
            retry: RetryConfig::default(),
            verification: VerificationConfig::default(),
            action_timeout_secs: 300,
            session_ttl_secs: 30 * 60,
            approval: ApprovalPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Session TTL as a [`Duration`].
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Action command timeout as a [`Duration`].
    #[must_use]
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

/// Weights for the symptom match score.
///
/// Structured signals are worth more than free-form tags: an exact metric
/// match says more than a shared label.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherWeights {
    /// Weight per matched free-form tag
    pub tag_weight: f64,
    /// Weight per matched structured signal
    pub signal_weight: f64,
}

impl Default for MatcherWeights {
    fn default() -> Self {
        Self {
            tag_weight: 1.0,
            signal_weight: 2.0,
        }
    }
}

/// Likelihood multipliers applied to a cause's belief per evidence outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LikelihoodConfig {
    /// Multiplier when the probe observed its expected signal
    pub pass: f64,
    /// Multiplier when the probe ran clean but the signal was absent
    pub fail: f64,
    /// Multiplier when the probe could not produce a verdict
    pub inconclusive: f64,
}

impl Default for LikelihoodConfig {
    fn default() -> Self {
        Self {
            pass: 3.0,
            fail: 0.2,
            inconclusive: 1.0,
        }
    }
}

/// Probe retry policy: bounded attempts with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per probe, including the first
    pub max_attempts: u32,
    /// Backoff before the second attempt, in seconds
    pub initial_backoff_secs: u64,
    /// Cap on the backoff between attempts, in seconds
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_secs: 2,
            max_backoff_secs: 30,
        }
    }
}

impl RetryConfig {
    /// Backoff to sleep after the given 1-based attempt number.
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let shifted = self.initial_backoff_secs.saturating_mul(1u64 << shift);
        Duration::from_secs(shifted.min(self.max_backoff_secs))
    }
}

/// Post-remediation verification polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Verification probe attempts before declaring the fix unverified
    pub attempts: u32,
    /// Delay between verification attempts, in seconds
    pub interval_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval_secs: 10,
        }
    }
}

/// Approval gating policy.
///
/// Only safe-risk actions are ever eligible for auto-approval. Moderate
/// actions always need an operator; destructive actions need one
/// regardless of any policy setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalPolicy {
    /// Auto-approve safe-risk actions
    pub auto_approve_safe: bool,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            auto_approve_safe: true,
        }
    }
}
