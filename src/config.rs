//! Engine configuration. See §6 EXTERNAL INTERFACES / "Configuration
//! options" for the recognized keys and their defaults.

use std::time::Duration;

/// Policy governing whether implicit internal step ids (assigned by a
/// per-kind call counter when the workflow omits an explicit `stepId`)
/// are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub enum DeterminismPolicy {
    Allow,
    Warn,
    Error,
}

impl Default for DeterminismPolicy {
    fn default() -> Self {
        DeterminismPolicy::Warn
    }
}

/// Engine-wide configuration, built with `with_*` methods the way
/// `ExecutorConfig`/`PollerConfig`/`WorkerPoolConfig` are in this lineage.
#[derive(Debug, Clone)]
pub struct DurableConfig {
    /// `execution.maxAttempts`
    pub max_attempts: u32,
    /// `execution.timeout`
    pub execution_timeout: Option<Duration>,
    /// `execution.kickoffFailsafeDelayMs`
    pub kickoff_failsafe_delay: Duration,
    /// `polling.enabled`
    pub polling_enabled: bool,
    /// `polling.interval`
    pub polling_interval: Duration,
    /// `polling.claimTtlMs`
    pub polling_claim_ttl: Duration,
    /// `audit.enabled`
    pub audit_enabled: bool,
    /// `determinism.implicitInternalStepIds`
    pub determinism_policy: DeterminismPolicy,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            execution_timeout: None,
            kickoff_failsafe_delay: Duration::from_millis(10_000),
            polling_enabled: true,
            polling_interval: Duration::from_millis(1000),
            polling_claim_ttl: Duration::from_millis(30_000),
            audit_enabled: false,
            determinism_policy: DeterminismPolicy::Warn,
        }
    }
}

impl DurableConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn with_kickoff_failsafe_delay(mut self, delay: Duration) -> Self {
        self.kickoff_failsafe_delay = delay;
        self
    }

    pub fn with_polling_enabled(mut self, enabled: bool) -> Self {
        self.polling_enabled = enabled;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_polling_claim_ttl(mut self, ttl: Duration) -> Self {
        self.polling_claim_ttl = ttl;
        self
    }

    pub fn with_audit_enabled(mut self, enabled: bool) -> Self {
        self.audit_enabled = enabled;
        self
    }

    pub fn with_determinism_policy(mut self, policy: DeterminismPolicy) -> Self {
        self.determinism_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = DurableConfig::default();
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.kickoff_failsafe_delay, Duration::from_millis(10_000));
        assert!(cfg.polling_enabled);
        assert_eq!(cfg.polling_interval, Duration::from_millis(1000));
        assert_eq!(cfg.polling_claim_ttl, Duration::from_millis(30_000));
        assert!(!cfg.audit_enabled);
        assert_eq!(cfg.determinism_policy, DeterminismPolicy::Warn);
    }

    #[test]
    fn builder_overrides_chain() {
        let cfg = DurableConfig::new()
            .with_max_attempts(5)
            .with_audit_enabled(true)
            .with_determinism_policy(DeterminismPolicy::Error);
        assert_eq!(cfg.max_attempts, 5);
        assert!(cfg.audit_enabled);
        assert_eq!(cfg.determinism_policy, DeterminismPolicy::Error);
    }
}
