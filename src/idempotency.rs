//! Idempotency replay: stores a call's outcome keyed by a caller-supplied
//! key and scope, and replays it verbatim on a later call before any other
//! gate runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::now_ms;
use crate::hash::digest_str;
use crate::state::StateStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IdempotencyPolicy {
    pub enabled: bool,
    pub ttl_ms: i64,
    /// When set, replay is scoped to the run that produced it; otherwise it
    /// is shared across every run for the tenant.
    pub namespace_by_run_key: bool,
    /// Whether a terminal failure outcome is cached for replay at all.
    pub include_errors: bool,
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_ms: 24 * 60 * 60 * 1_000,
            namespace_by_run_key: true,
            include_errors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdempotencyRecord {
    stored_at: i64,
    expires_at: i64,
    outcome: Value,
}

/// `idempotency:scope:toolName:SHA256(idempotencyKey)`, where `scope` is the
/// run key when `namespace_by_run_key` is set, or `"global"` otherwise.
/// `toolName` is always its own segment regardless of the scope in use.
fn record_key(
    policy: &IdempotencyPolicy,
    run_key: &str,
    tool_name: &str,
    idempotency_key: &str,
) -> String {
    let scope = if policy.namespace_by_run_key {
        run_key
    } else {
        "global"
    };
    format!(
        "idempotency:{}:{}:{}",
        scope,
        tool_name,
        digest_str(idempotency_key)
    )
}

/// Look up a previously stored outcome. Returns `None` on a miss or an
/// expired record (expired records are left for the store's own eviction —
/// this module does not assume write access is cheap on read).
pub async fn find_replay(
    store: &dyn StateStore,
    policy: &IdempotencyPolicy,
    run_key: &str,
    tool_name: &str,
    idempotency_key: &str,
) -> Option<Value> {
    if !policy.enabled {
        return None;
    }
    let key = record_key(policy, run_key, tool_name, idempotency_key);
    let raw = store.get(&key).await?;
    let record: IdempotencyRecord = serde_json::from_value(raw).ok()?;
    if record.expires_at <= now_ms() {
        return None;
    }
    Some(record.outcome)
}

/// Store `outcome` under `idempotency_key`, stamped to expire after the
/// policy's TTL.
pub async fn store_outcome(
    store: &dyn StateStore,
    policy: &IdempotencyPolicy,
    run_key: &str,
    tool_name: &str,
    idempotency_key: &str,
    outcome: Value,
) {
    if !policy.enabled {
        return;
    }
    let key = record_key(policy, run_key, tool_name, idempotency_key);
    let now = now_ms();
    let record = IdempotencyRecord {
        stored_at: now,
        expires_at: now + policy.ttl_ms,
        outcome,
    };
    store
        .set(&key, serde_json::to_value(record).unwrap_or_default())
        .await;
}
