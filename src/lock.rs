//! Named resource leases with reject/wait acquisition semantics.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::now_ms;
use crate::error::ToolCallError;
use crate::hash::digest_str;
use crate::state::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    Reject,
    Wait,
}

impl Default for WaitMode {
    fn default() -> Self {
        WaitMode::Reject
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencyPolicy {
    pub enabled: bool,
    pub lease_ms: i64,
    pub wait_mode: WaitMode,
    pub wait_timeout_ms: i64,
    pub poll_interval_ms: i64,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            lease_ms: 30_000,
            wait_mode: WaitMode::Reject,
            wait_timeout_ms: 5_000,
            poll_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    owner: String,
    expires_at: i64,
}

/// What happened while acquiring the lock — used to decide which event to
/// emit without the lock manager needing an event bus dependency of its own.
pub enum AcquireOutcome {
    Acquired { owner: String, waited: bool },
    Rejected,
    WaitTimedOut,
}

fn lock_key(resource_key: &str) -> String {
    format!("lock:{}", digest_str(resource_key))
}

/// Attempt to acquire the lease for `resource_key`. `timeout_ms` is the
/// call's effective timeout, used as a floor for the lease duration so a
/// lease never expires mid-execution under normal conditions.
pub async fn acquire(
    store: &dyn StateStore,
    resource_key: &str,
    policy: &ConcurrencyPolicy,
    timeout_ms: i64,
) -> Result<AcquireOutcome, ToolCallError> {
    let key = lock_key(resource_key);
    let lease_ms = policy.lease_ms.max(timeout_ms + 1_000);
    let owner = uuid::Uuid::new_v4().to_string();

    if try_acquire_once(store, &key, &owner, lease_ms).await {
        return Ok(AcquireOutcome::Acquired {
            owner,
            waited: false,
        });
    }

    match policy.wait_mode {
        WaitMode::Reject => Ok(AcquireOutcome::Rejected),
        WaitMode::Wait => {
            let deadline = now_ms() + policy.wait_timeout_ms;
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(
                    policy.poll_interval_ms.max(1) as u64,
                ))
                .await;
                if try_acquire_once(store, &key, &owner, lease_ms).await {
                    return Ok(AcquireOutcome::Acquired {
                        owner,
                        waited: true,
                    });
                }
                if now_ms() >= deadline {
                    return Ok(AcquireOutcome::WaitTimedOut);
                }
            }
        }
    }
}

async fn try_acquire_once(store: &dyn StateStore, key: &str, owner: &str, lease_ms: i64) -> bool {
    let now = now_ms();
    if let Some(existing) = store.get(key).await {
        if let Ok(record) = serde_json::from_value::<LockRecord>(existing) {
            if record.expires_at > now {
                return false;
            }
        }
    }
    let record = LockRecord {
        owner: owner.to_string(),
        expires_at: now + lease_ms,
    };
    store
        .set(key, serde_json::to_value(record).unwrap_or_default())
        .await;
    true
}

/// Release the lease, but only if `owner` still holds it — prevents a
/// releaser whose lease already expired from deleting a newer holder's record.
pub async fn release(store: &dyn StateStore, resource_key: &str, owner: &str) {
    let key = lock_key(resource_key);
    if let Some(existing) = store.get(&key).await {
        if let Ok(record) = serde_json::from_value::<LockRecord>(existing) {
            if record.owner == owner {
                store.delete(&key).await;
            }
        }
    }
}
