//! Fingerprint + outcome-hash streak tracking with warning/quarantine/stop
//! thresholds.

use serde::{Deserialize, Serialize};

use crate::clock::now_ms;
use crate::hash::{build_fingerprint, build_outcome_hash, OutcomeSummary};
use crate::state::StateStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoopBreakerPolicy {
    pub enabled: bool,
    pub warning_threshold: u32,
    pub quarantine_threshold: u32,
    pub stop_threshold: u32,
    pub quarantine_ms: i64,
    pub stop_ms: i64,
    pub max_fingerprints: usize,
}

impl Default for LoopBreakerPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            warning_threshold: 5,
            quarantine_threshold: 8,
            stop_threshold: 12,
            quarantine_ms: 15_000,
            stop_ms: 120_000,
            max_fingerprints: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LoopState {
    streak: u32,
    last_outcome_hash: Option<String>,
    last_seen_at: i64,
    quarantine_until: Option<i64>,
    stop_until: Option<i64>,
    warned: bool,
}

/// Why a pre-call check blocked the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopBlock {
    Stopped,
    Quarantined,
}

/// What happened after recording an outcome — used by the orchestrator to
/// decide which event, if any, to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopTransition {
    None,
    EnteredWarning,
    EnteredQuarantine,
    EnteredStop,
}

fn loop_key(fingerprint: &str) -> String {
    format!("loop:{fingerprint}")
}

async fn load(store: &dyn StateStore, fingerprint: &str) -> LoopState {
    store
        .get(&loop_key(fingerprint))
        .await
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

async fn save(store: &dyn StateStore, fingerprint: &str, state: &LoopState) {
    store
        .set(&loop_key(fingerprint), serde_json::to_value(state).unwrap_or_default())
        .await;
}

/// Pre-call check: rejects if the fingerprint is currently quarantined or
/// stopped, otherwise refreshes `lastSeenAt`.
pub async fn check_pre_call(
    store: &dyn StateStore,
    policy: &LoopBreakerPolicy,
    tool_name: &str,
    args: Option<&serde_json::Value>,
) -> Result<(), LoopBlock> {
    if !policy.enabled {
        return Ok(());
    }
    let fingerprint = build_fingerprint(tool_name, args);
    let mut state = load(store, &fingerprint).await;
    let now = now_ms();

    if let Some(stop_until) = state.stop_until {
        if stop_until > now {
            return Err(LoopBlock::Stopped);
        }
    }
    if let Some(quarantine_until) = state.quarantine_until {
        if quarantine_until > now {
            return Err(LoopBlock::Quarantined);
        }
    }

    state.last_seen_at = now;
    save(store, &fingerprint, &state).await;
    Ok(())
}

/// Post-call: record the outcome, advance or reset the streak, and report
/// any threshold transition that just occurred.
pub async fn record_outcome(
    store: &dyn StateStore,
    policy: &LoopBreakerPolicy,
    tool_name: &str,
    args: Option<&serde_json::Value>,
    summary: &OutcomeSummary<'_>,
) -> LoopTransition {
    if !policy.enabled {
        return LoopTransition::None;
    }
    let fingerprint = build_fingerprint(tool_name, args);
    let mut state = load(store, &fingerprint).await;
    let now = now_ms();
    let outcome_hash = build_outcome_hash(summary);

    if state.last_outcome_hash.as_deref() == Some(outcome_hash.as_str()) {
        state.streak += 1;
    } else {
        state.streak = 1;
        state.last_outcome_hash = Some(outcome_hash);
        state.quarantine_until = None;
        state.stop_until = None;
        state.warned = false;
    }
    state.last_seen_at = now;

    let transition = if state.streak >= policy.stop_threshold {
        let entering = state.stop_until.is_none();
        state.stop_until = Some(now + policy.stop_ms);
        if entering {
            LoopTransition::EnteredStop
        } else {
            LoopTransition::None
        }
    } else if state.streak >= policy.quarantine_threshold {
        let entering = state.quarantine_until.is_none();
        state.quarantine_until = Some(now + policy.quarantine_ms);
        if entering {
            LoopTransition::EnteredQuarantine
        } else {
            LoopTransition::None
        }
    } else if state.streak >= policy.warning_threshold {
        if !state.warned {
            state.warned = true;
            LoopTransition::EnteredWarning
        } else {
            LoopTransition::None
        }
    } else {
        LoopTransition::None
    };

    save(store, &fingerprint, &state).await;
    prune(store, policy).await;
    transition
}

/// Drop the single oldest-by-`lastSeenAt` fingerprint once the tracked count
/// exceeds `maxFingerprints`. Only applies to adapters that can enumerate.
async fn prune(store: &dyn StateStore, policy: &LoopBreakerPolicy) {
    let Some(keys) = store.keys().await else {
        return;
    };
    let loop_keys: Vec<&String> = keys.iter().filter(|k| k.starts_with("loop:")).collect();
    if loop_keys.len() <= policy.max_fingerprints {
        return;
    }

    let mut oldest: Option<(String, i64)> = None;
    for key in loop_keys {
        if let Some(raw) = store.get(key).await {
            if let Ok(state) = serde_json::from_value::<LoopState>(raw) {
                if oldest
                    .as_ref()
                    .map(|(_, ts)| state.last_seen_at < *ts)
                    .unwrap_or(true)
                {
                    oldest = Some((key.clone(), state.last_seen_at));
                }
            }
        }
    }
    if let Some((key, _)) = oldest {
        store.delete(&key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryStateStore;

    fn policy() -> LoopBreakerPolicy {
        LoopBreakerPolicy {
            enabled: true,
            warning_threshold: 3,
            quarantine_threshold: 5,
            stop_threshold: 7,
            quarantine_ms: 1_000,
            stop_ms: 5_000,
            max_fingerprints: 1_000,
        }
    }

    fn same_outcome() -> OutcomeSummary<'static> {
        OutcomeSummary {
            ok: false,
            status_code: Some(500),
            code: Some("NETWORK_ERROR"),
            message: Some("boom"),
            data: None,
        }
    }

    #[tokio::test]
    async fn warning_fires_once_on_transition_into_the_band() {
        let store = InMemoryStateStore::new();
        let p = policy();
        let mut transitions = Vec::new();
        for _ in 0..6 {
            let t = record_outcome(&store, &p, "search", None, &same_outcome()).await;
            transitions.push(t);
        }
        let warnings = transitions
            .iter()
            .filter(|t| **t == LoopTransition::EnteredWarning)
            .count();
        assert_eq!(warnings, 1);
        assert!(transitions.contains(&LoopTransition::EnteredQuarantine));
    }

    #[tokio::test]
    async fn differing_outcome_resets_the_streak() {
        let store = InMemoryStateStore::new();
        let p = policy();
        record_outcome(&store, &p, "search", None, &same_outcome()).await;
        record_outcome(&store, &p, "search", None, &same_outcome()).await;

        let different = OutcomeSummary {
            ok: true,
            status_code: Some(200),
            code: None,
            message: None,
            data: None,
        };
        let t = record_outcome(&store, &p, "search", None, &different).await;
        assert_eq!(t, LoopTransition::None);

        for _ in 0..2 {
            record_outcome(&store, &p, "search", None, &different).await;
        }
        let t = record_outcome(&store, &p, "search", None, &different).await;
        assert_eq!(t, LoopTransition::EnteredWarning);
    }

    #[tokio::test]
    async fn quarantined_fingerprint_blocks_pre_call() {
        let store = InMemoryStateStore::new();
        let p = policy();
        for _ in 0..5 {
            record_outcome(&store, &p, "search", None, &same_outcome()).await;
        }
        let result = check_pre_call(&store, &p, "search", None).await;
        assert_eq!(result, Err(LoopBlock::Quarantined));
    }

    #[tokio::test]
    async fn stopped_fingerprint_blocks_pre_call_over_quarantined() {
        let store = InMemoryStateStore::new();
        let p = policy();
        for _ in 0..7 {
            record_outcome(&store, &p, "search", None, &same_outcome()).await;
        }
        let result = check_pre_call(&store, &p, "search", None).await;
        assert_eq!(result, Err(LoopBlock::Stopped));
    }

    #[tokio::test]
    async fn disabled_policy_never_blocks() {
        let store = InMemoryStateStore::new();
        let p = LoopBreakerPolicy {
            enabled: false,
            ..policy()
        };
        for _ in 0..20 {
            record_outcome(&store, &p, "search", None, &same_outcome()).await;
        }
        assert!(check_pre_call(&store, &p, "search", None).await.is_ok());
    }
}
