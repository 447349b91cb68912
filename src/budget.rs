//! Per-`(tenant, runKey)` monotonic call counter with a configurable ceiling.

use serde::{Deserialize, Serialize};

use crate::state::StateStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetPolicy {
    pub enabled: bool,
    pub max_calls: u64,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_calls: 100,
        }
    }
}

fn budget_key(run_key: &str) -> String {
    format!("budget:{run_key}")
}

/// Increment the counter for `run_key` and report whether the call that just
/// consumed a unit of budget pushed the count past the ceiling. The increment
/// happens unconditionally — counting, not gating, is this function's job;
/// the orchestrator decides what to do with an over-budget result.
pub async fn increment(store: &dyn StateStore, policy: &BudgetPolicy, run_key: &str) -> u64 {
    let key = budget_key(run_key);
    let current = store
        .get(&key)
        .await
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let next = current + 1;
    store.set(&key, serde_json::json!(next)).await;
    next
}

pub async fn current(store: &dyn StateStore, run_key: &str) -> u64 {
    store
        .get(&budget_key(run_key))
        .await
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

pub fn is_exhausted(policy: &BudgetPolicy, count: u64) -> bool {
    policy.enabled && count > policy.max_calls
}

/// Reset the counter for `run_key` to zero. Used when a caller starts a new
/// logical run under the same run key (e.g. after an exit condition fires).
pub async fn reset(store: &dyn StateStore, run_key: &str) {
    store.delete(&budget_key(run_key)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryStateStore;

    #[tokio::test]
    async fn increments_are_per_run_key() {
        let store = InMemoryStateStore::new();
        assert_eq!(increment(&store, &BudgetPolicy::default(), "run-a").await, 1);
        assert_eq!(increment(&store, &BudgetPolicy::default(), "run-a").await, 2);
        assert_eq!(increment(&store, &BudgetPolicy::default(), "run-b").await, 1);
    }

    #[tokio::test]
    async fn exhaustion_trips_once_count_exceeds_ceiling() {
        let policy = BudgetPolicy {
            enabled: true,
            max_calls: 2,
        };
        let store = InMemoryStateStore::new();
        let c1 = increment(&store, &policy, "run-a").await;
        assert!(!is_exhausted(&policy, c1));
        let c2 = increment(&store, &policy, "run-a").await;
        assert!(!is_exhausted(&policy, c2));
        let c3 = increment(&store, &policy, "run-a").await;
        assert!(is_exhausted(&policy, c3));
    }

    #[tokio::test]
    async fn disabled_policy_is_never_exhausted() {
        let policy = BudgetPolicy {
            enabled: false,
            max_calls: 1,
        };
        assert!(!is_exhausted(&policy, 1_000));
    }

    #[tokio::test]
    async fn reset_clears_the_counter() {
        let store = InMemoryStateStore::new();
        increment(&store, &BudgetPolicy::default(), "run-a").await;
        reset(&store, "run-a").await;
        assert_eq!(current(&store, "run-a").await, 0);
    }
}
