//! Rolling-window failure-rate circuit breaker per `(tenant, tool, destination)`.
//!
//! Unlike a discrete consecutive-failure state machine, this tracks a
//! trimmed window of recent pass/fail samples and opens once both the
//! sample count and the failure ratio clear their thresholds.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::clock::now_ms;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerPolicy {
    pub enabled: bool,
    pub window_ms: i64,
    pub min_requests: u32,
    pub failure_rate_threshold: f64,
    pub cooldown_ms: i64,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: 30_000,
            min_requests: 20,
            failure_rate_threshold: 0.6,
            cooldown_ms: 60_000,
        }
    }
}

#[derive(Debug, Error)]
#[error("circuit breaker open for {key}")]
pub struct CircuitOpenError {
    pub key: String,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: i64,
    failed: bool,
}

#[derive(Debug, Default)]
struct CircuitState {
    samples: Vec<Sample>,
    open_until: Option<i64>,
}

/// Registry of circuit state keyed by `tenant:toolName:destinationHost`.
/// `RwLock<HashMap>`-backed, matching the read-heavy access pattern (most
/// calls check-then-record rather than contend on the same key).
pub struct CircuitBreakerRegistry {
    tenant: String,
    states: RwLock<std::collections::HashMap<String, CircuitState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(tenant: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            tenant: tenant.into(),
            states: RwLock::new(std::collections::HashMap::new()),
        })
    }

    fn key(&self, tool_name: &str, destination_host: &str) -> String {
        format!("{}:{}:{}", self.tenant, tool_name, destination_host)
    }

    /// Pre-call check: returns `Err` if the circuit for this key is open.
    pub fn check(
        &self,
        policy: &CircuitBreakerPolicy,
        tool_name: &str,
        destination_host: &str,
    ) -> Result<(), CircuitOpenError> {
        if !policy.enabled {
            return Ok(());
        }
        let key = self.key(tool_name, destination_host);
        let states = self.states.read();
        if let Some(state) = states.get(&key) {
            if let Some(open_until) = state.open_until {
                if open_until > now_ms() {
                    return Err(CircuitOpenError { key });
                }
            }
        }
        Ok(())
    }

    /// Record a sample and return whether this record just transitioned the
    /// circuit from closed to open (used to decide whether to emit `circuit_open`).
    pub fn record(
        &self,
        policy: &CircuitBreakerPolicy,
        tool_name: &str,
        destination_host: &str,
        failed: bool,
    ) -> bool {
        if !policy.enabled {
            return false;
        }
        let key = self.key(tool_name, destination_host);
        let now = now_ms();
        let mut states = self.states.write();
        let state = states.entry(key).or_default();

        state.samples.push(Sample { at: now, failed });
        let window_start = now - policy.window_ms;
        state.samples.retain(|s| s.at >= window_start);

        let total = state.samples.len() as u32;
        let failures = state.samples.iter().filter(|s| s.failed).count() as u32;
        let ratio = if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64
        };

        let was_open = state.open_until.map(|u| u > now).unwrap_or(false);
        if total >= policy.min_requests && ratio >= policy.failure_rate_threshold {
            state.open_until = Some(now + policy.cooldown_ms);
            !was_open
        } else if !was_open {
            state.open_until = None;
            false
        } else {
            false
        }
    }

    #[cfg(test)]
    fn is_open(&self, tool_name: &str, destination_host: &str) -> bool {
        let key = self.key(tool_name, destination_host);
        let states = self.states.read();
        states
            .get(&key)
            .and_then(|s| s.open_until)
            .map(|u| u > now_ms())
            .unwrap_or(false)
    }
}

/// URL-parse-then-netloc host normalization; missing destination becomes `"default"`.
pub fn normalize_destination_host(destination: Option<&str>) -> String {
    let Some(destination) = destination else {
        return "default".to_string();
    };
    if let Ok(url) = Url::parse(destination) {
        if let Some(host) = url.host_str() {
            return host.to_string();
        }
    }
    destination.to_string()
}
