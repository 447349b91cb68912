//! Configuration model: clamped global defaults plus per-call override
//! resolution by destination and tool.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetPolicy;
use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::error::ConfigError;
use crate::idempotency::IdempotencyPolicy;
use crate::lock::ConcurrencyPolicy;
use crate::loop_breaker::LoopBreakerPolicy;
use crate::policy::{ApprovalHandler, PolicyMode, PolicyRule};
use crate::retry::{RetryClassifier, RetryPolicy};
use crate::state::{StateStore, TenantStateStore};

fn clamp(value: i64, min: i64, max: i64, default: i64) -> i64 {
    if value < min || value > max {
        default.clamp(min, max)
    } else {
        value
    }
}

fn clamp_f64(value: f64, min: f64, max: f64, default: f64) -> f64 {
    if value.is_nan() || value < min || value > max {
        default.clamp(min, max)
    } else {
        value
    }
}

/// Refinements applied to the global config for calls matching a particular
/// destination host or tool name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverride {
    pub timeout_ms: Option<i64>,
    pub retry: Option<RetryPolicy>,
    pub loop_breaker: Option<LoopBreakerPolicy>,
    pub circuit_breaker: Option<CircuitBreakerPolicy>,
}

/// Raw, user-facing configuration before clamping. Construct this, then call
/// [`RuntimeConfigBuilder::resolve`] once to obtain the immutable, clamped
/// [`RuntimeConfig`] the orchestrator actually consumes.
pub struct RuntimeConfigBuilder {
    pub tenant: String,
    pub timeout_ms: i64,
    pub max_calls: Option<u64>,
    pub retry: RetryPolicy,
    pub loop_breaker: LoopBreakerPolicy,
    pub circuit_breaker: CircuitBreakerPolicy,
    pub idempotency: IdempotencyPolicy,
    pub concurrency: ConcurrencyPolicy,
    pub policy_rules: Vec<PolicyRule>,
    pub policy_mode: PolicyMode,
    pub approval_handler: Option<Arc<dyn ApprovalHandler>>,
    pub retry_classifier: Option<Arc<dyn RetryClassifier>>,
    pub destination_overrides: Vec<(String, ConfigOverride)>,
    pub tool_overrides: Vec<(String, ConfigOverride)>,
    pub state_store: Arc<dyn StateStore>,
}

impl Default for RuntimeConfigBuilder {
    fn default() -> Self {
        Self {
            tenant: "default".to_string(),
            timeout_ms: 60_000,
            max_calls: None,
            retry: RetryPolicy::default(),
            loop_breaker: LoopBreakerPolicy::default(),
            circuit_breaker: CircuitBreakerPolicy::default(),
            idempotency: IdempotencyPolicy::default(),
            concurrency: ConcurrencyPolicy::default(),
            policy_rules: Vec::new(),
            policy_mode: PolicyMode::default(),
            approval_handler: None,
            retry_classifier: None,
            destination_overrides: Vec::new(),
            tool_overrides: Vec::new(),
            state_store: Arc::new(crate::state::InMemoryStateStore::new()),
        }
    }
}

impl RuntimeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamp every numeric knob to its documented range and freeze the
    /// result. This is the one-time validation pass; per-call override
    /// resolution happens afterward against the clamped base.
    pub fn resolve(self) -> Result<RuntimeConfig, ConfigError> {
        if self.tenant.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "tenant".to_string(),
                reason: "must not be blank".to_string(),
            });
        }

        let timeout_ms = clamp(self.timeout_ms, 0, 600_000, 60_000);

        let retry = RetryPolicy {
            max_attempts: self.retry.max_attempts.clamp(1, 20),
            initial_delay_ms: clamp(self.retry.initial_delay_ms, 0, 60_000, 250),
            max_delay_ms: clamp(self.retry.max_delay_ms, 0, 300_000, 10_000),
            backoff_factor: clamp_f64(self.retry.backoff_factor, 1.0, 10.0, 2.0),
            jitter_ratio: clamp_f64(self.retry.jitter_ratio, 0.0, 1.0, 0.2),
        };

        let mut loop_breaker = LoopBreakerPolicy {
            enabled: self.loop_breaker.enabled,
            warning_threshold: self.loop_breaker.warning_threshold.max(1),
            quarantine_threshold: self.loop_breaker.quarantine_threshold.max(1),
            stop_threshold: self.loop_breaker.stop_threshold.max(1),
            quarantine_ms: clamp(self.loop_breaker.quarantine_ms, 0, 3_600_000, 15_000),
            stop_ms: clamp(self.loop_breaker.stop_ms, 0, 3_600_000, 120_000),
            max_fingerprints: self.loop_breaker.max_fingerprints.max(20),
        };
        // Invariant (c): warning <= quarantine <= stop.
        loop_breaker.quarantine_threshold = loop_breaker.quarantine_threshold.max(loop_breaker.warning_threshold);
        loop_breaker.stop_threshold = loop_breaker.stop_threshold.max(loop_breaker.quarantine_threshold);

        let circuit_breaker = CircuitBreakerPolicy {
            enabled: self.circuit_breaker.enabled,
            window_ms: clamp(self.circuit_breaker.window_ms, 1_000, 3_600_000, 30_000),
            min_requests: self.circuit_breaker.min_requests.max(1),
            failure_rate_threshold: clamp_f64(self.circuit_breaker.failure_rate_threshold, 0.0, 1.0, 0.6),
            cooldown_ms: clamp(self.circuit_breaker.cooldown_ms, 0, 3_600_000, 60_000),
        };

        let concurrency = ConcurrencyPolicy {
            enabled: self.concurrency.enabled,
            lease_ms: clamp(self.concurrency.lease_ms, 100, 3_600_000, 30_000),
            wait_mode: self.concurrency.wait_mode,
            wait_timeout_ms: clamp(self.concurrency.wait_timeout_ms, 0, 600_000, 5_000),
            poll_interval_ms: clamp(self.concurrency.poll_interval_ms, 1, 60_000, 50),
        };

        let state_store: Arc<dyn StateStore> =
            Arc::new(TenantStateStore::new(self.state_store, self.tenant.clone()));

        Ok(RuntimeConfig {
            tenant: self.tenant,
            timeout_ms,
            max_calls: self.max_calls,
            retry,
            loop_breaker,
            circuit_breaker,
            idempotency: self.idempotency,
            concurrency,
            policy_rules: self.policy_rules,
            policy_mode: self.policy_mode,
            approval_handler: self.approval_handler,
            retry_classifier: self.retry_classifier,
            destination_overrides: self.destination_overrides,
            tool_overrides: self.tool_overrides,
            state_store,
        })
    }
}

/// Immutable, clamped configuration. Construct via [`RuntimeConfigBuilder::resolve`].
#[derive(Clone)]
pub struct RuntimeConfig {
    pub tenant: String,
    pub timeout_ms: i64,
    pub max_calls: Option<u64>,
    pub retry: RetryPolicy,
    pub loop_breaker: LoopBreakerPolicy,
    pub circuit_breaker: CircuitBreakerPolicy,
    pub idempotency: IdempotencyPolicy,
    pub concurrency: ConcurrencyPolicy,
    pub policy_rules: Vec<PolicyRule>,
    pub policy_mode: PolicyMode,
    pub approval_handler: Option<Arc<dyn ApprovalHandler>>,
    pub retry_classifier: Option<Arc<dyn RetryClassifier>>,
    pub destination_overrides: Vec<(String, ConfigOverride)>,
    pub tool_overrides: Vec<(String, ConfigOverride)>,
    pub state_store: Arc<dyn StateStore>,
}

/// The fields that vary per-call after override resolution.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub timeout_ms: i64,
    pub retry: RetryPolicy,
    pub loop_breaker: LoopBreakerPolicy,
    pub circuit_breaker: CircuitBreakerPolicy,
}

fn pattern_specificity(pattern: &str, candidate: &str) -> Option<u8> {
    if pattern == "*" {
        Some(0)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        candidate.starts_with(prefix).then_some(1)
    } else {
        (pattern == candidate).then_some(2)
    }
}

fn apply_override(base: &mut EffectiveConfig, over: &ConfigOverride) {
    if let Some(timeout_ms) = over.timeout_ms {
        base.timeout_ms = timeout_ms;
    }
    if let Some(retry) = over.retry {
        base.retry = retry;
    }
    if let Some(loop_breaker) = over.loop_breaker {
        base.loop_breaker = loop_breaker;
    }
    if let Some(circuit_breaker) = over.circuit_breaker {
        base.circuit_breaker = circuit_breaker;
    }
}

/// Resolve per-call overrides: first by destination host (most specific
/// pattern wins), then by tool name (exact > `prefix*` > `*`) applied on top
/// so tool overrides win ties with destination overrides.
pub fn resolve_effective_config(
    config: &RuntimeConfig,
    tool_name: &str,
    destination_host: Option<&str>,
) -> EffectiveConfig {
    let mut effective = EffectiveConfig {
        timeout_ms: config.timeout_ms,
        retry: config.retry,
        loop_breaker: config.loop_breaker,
        circuit_breaker: config.circuit_breaker,
    };

    if let Some(host) = destination_host {
        let mut best: Option<(u8, &ConfigOverride)> = None;
        for (pattern, over) in &config.destination_overrides {
            if let Some(spec) = pattern_specificity(pattern, host) {
                if best.map(|(b, _)| spec > b).unwrap_or(true) {
                    best = Some((spec, over));
                }
            }
        }
        if let Some((_, over)) = best {
            apply_override(&mut effective, over);
        }
    }

    let mut best: Option<(u8, &ConfigOverride)> = None;
    for (pattern, over) in &config.tool_overrides {
        if let Some(spec) = pattern_specificity(pattern, tool_name) {
            if best.map(|(b, _)| spec > b).unwrap_or(true) {
                best = Some((spec, over));
            }
        }
    }
    if let Some((_, over)) = best {
        apply_override(&mut effective, over);
    }

    effective
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_tenant_is_rejected() {
        let builder = RuntimeConfigBuilder {
            tenant: "  ".to_string(),
            ..RuntimeConfigBuilder::default()
        };
        assert!(builder.resolve().is_err());
    }

    #[test]
    fn out_of_range_values_clamp_to_default() {
        let builder = RuntimeConfigBuilder {
            timeout_ms: -5,
            ..RuntimeConfigBuilder::default()
        };
        let resolved = builder.resolve().unwrap();
        assert_eq!(resolved.timeout_ms, 60_000);
    }

    #[test]
    fn loop_thresholds_are_forced_into_order() {
        let builder = RuntimeConfigBuilder {
            loop_breaker: LoopBreakerPolicy {
                warning_threshold: 10,
                quarantine_threshold: 5,
                stop_threshold: 3,
                ..LoopBreakerPolicy::default()
            },
            ..RuntimeConfigBuilder::default()
        };
        let resolved = builder.resolve().unwrap();
        assert!(resolved.loop_breaker.warning_threshold <= resolved.loop_breaker.quarantine_threshold);
        assert!(resolved.loop_breaker.quarantine_threshold <= resolved.loop_breaker.stop_threshold);
    }

    #[test]
    fn tool_override_wins_tie_against_destination_override() {
        let mut builder = RuntimeConfigBuilder::default();
        builder.destination_overrides.push((
            "*".to_string(),
            ConfigOverride {
                timeout_ms: Some(1_000),
                ..Default::default()
            },
        ));
        builder.tool_overrides.push((
            "*".to_string(),
            ConfigOverride {
                timeout_ms: Some(2_000),
                ..Default::default()
            },
        ));
        let resolved = builder.resolve().unwrap();
        let effective = resolve_effective_config(&resolved, "http", Some("anything"));
        assert_eq!(effective.timeout_ms, 2_000);
    }

    #[test]
    fn more_specific_destination_pattern_wins() {
        let mut builder = RuntimeConfigBuilder::default();
        builder.destination_overrides.push((
            "*".to_string(),
            ConfigOverride {
                timeout_ms: Some(1_000),
                ..Default::default()
            },
        ));
        builder.destination_overrides.push((
            "api.acme.local".to_string(),
            ConfigOverride {
                timeout_ms: Some(9_000),
                ..Default::default()
            },
        ));
        let resolved = builder.resolve().unwrap();
        let effective = resolve_effective_config(&resolved, "http", Some("api.acme.local"));
        assert_eq!(effective.timeout_ms, 9_000);
    }
}
