//! Event bus: a single synchronous `on_event` hook plus fan-out to
//! independently-scheduled sinks. A sink failure is isolated and routed to
//! the sink-failure hook; it never reaches the orchestrator's return path.

use crate::clock::now_ms;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Every event kind the core can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Retry,
    LoopWarning,
    LoopQuarantine,
    LoopStop,
    CircuitOpen,
    BudgetStop,
    PolicyDenied,
    PolicyApprovalRequired,
    PolicyApproved,
    PolicyDryRun,
    VerifierRejected,
    IdempotencyReplay,
    ConcurrencyWait,
    ConcurrencyRejected,
}

/// A single emitted event. `data` carries kind-specific structured fields
/// (tool name, reason, attempt number, etc.) as a JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub kind: EventKind,
    pub timestamp: i64,
    pub tenant: String,
    pub tool_name: Option<String>,
    pub run_key: Option<String>,
    pub data: Value,
}

/// Synchronous observer, invoked inline before sinks are dispatched.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &RuntimeEvent);
}

/// An independently-dispatched event sink. A slow or failing sink never
/// blocks or fails another sink's dispatch.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, event: &RuntimeEvent) -> Result<(), String>;
}

/// Invoked when a sink returns an error, with enough context to identify
/// which sink and which event failed.
pub trait SinkFailureHandler: Send + Sync {
    fn on_sink_failure(&self, sink_index: usize, event: &RuntimeEvent, failure: &str);
}

/// Fans a single emitted event out to an optional synchronous observer and
/// any number of async sinks.
pub struct EventBus {
    tenant: String,
    observer: Option<Arc<dyn EventObserver>>,
    sinks: Vec<Arc<dyn EventSink>>,
    sink_failure_handler: Option<Arc<dyn SinkFailureHandler>>,
}

impl EventBus {
    pub fn new(
        tenant: impl Into<String>,
        observer: Option<Arc<dyn EventObserver>>,
        sinks: Vec<Arc<dyn EventSink>>,
        sink_failure_handler: Option<Arc<dyn SinkFailureHandler>>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            observer,
            sinks,
            sink_failure_handler,
        }
    }

    /// Build and dispatch an event. Never suspends the caller past the
    /// synchronous observer call; sink dispatch is spawned independently.
    pub fn emit(
        &self,
        kind: EventKind,
        tool_name: Option<&str>,
        run_key: Option<&str>,
        data: Value,
    ) {
        let event = RuntimeEvent {
            kind,
            timestamp: now_ms(),
            tenant: self.tenant.clone(),
            tool_name: tool_name.map(|s| s.to_string()),
            run_key: run_key.map(|s| s.to_string()),
            data,
        };

        tracing::debug!(kind = ?event.kind, tool_name = ?event.tool_name, "runtime event emitted");

        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }

        for (index, sink) in self.sinks.iter().enumerate() {
            let sink = sink.clone();
            let event = event.clone();
            let failure_handler = self.sink_failure_handler.clone();
            tokio::spawn(async move {
                if let Err(failure) = sink.handle(&event).await {
                    if let Some(handler) = failure_handler {
                        handler.on_sink_failure(index, &event, &failure);
                    } else {
                        tracing::warn!(sink_index = index, %failure, "event sink failed");
                    }
                }
            });
        }
    }
}
