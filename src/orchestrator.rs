//! The outer `run` orchestrator: composes policy, verifiers, idempotency,
//! budget, loop breaker, lock, circuit breaker, timeout, and retry into the
//! single gate pipeline described for one call.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::Instrument;

use crate::abort::{race, sleep_with_abort, AbortReason, AbortSignal, RunSignal};
use crate::budget;
use crate::circuit_breaker::{normalize_destination_host, CircuitBreakerRegistry};
use crate::config::{resolve_effective_config, RuntimeConfig};
use crate::error::{ToolCallError, ToolCallResult};
use crate::events::{EventBus, EventKind};
use crate::failure::normalize_failure;
use crate::hash::OutcomeSummary;
use crate::idempotency;
use crate::lock::{self, AcquireOutcome};
use crate::loop_breaker::{self, LoopBlock, LoopTransition};
use crate::policy::{self, ApprovalContext, PolicyDecision};
use crate::retry::{compute_backoff_delay, resolve_retry_decision};
use crate::verifier::{
    AfterErrorContext, AfterErrorOutcome, AfterErrorVerifier, AfterSuccessContext,
    AfterSuccessVerifier, BeforeCallChain, BeforeCallContext, VerifierDecision, VerifierPhase,
};

/// Per-call input. `run_key` is normalized to `"default"` when blank.
#[derive(Clone, Default)]
pub struct CallContext {
    pub tool_name: String,
    pub run_key: Option<String>,
    pub destination: Option<String>,
    pub action: Option<String>,
    pub args: Option<Value>,
    pub idempotency_key: Option<String>,
    pub resource_key: Option<String>,
    pub caller_signal: Option<AbortSignal>,
    pub timeout_override_ms: Option<i64>,
}

fn normalized_run_key(context: &CallContext) -> String {
    match &context.run_key {
        Some(key) if !key.trim().is_empty() => key.clone(),
        _ => "default".to_string(),
    }
}

/// Handed to the executor closure so it can propagate cancellation into
/// whatever I/O it performs.
pub struct ExecutionRuntime {
    pub signal: AbortSignal,
}

/// Composes every gate. Construct via [`RuntimeControls::create`].
pub struct RuntimeControls {
    config: RuntimeConfig,
    events: EventBus,
    circuits: Arc<CircuitBreakerRegistry>,
    before_call: BeforeCallChain,
    after_success: Option<Arc<dyn AfterSuccessVerifier>>,
    after_error: Option<Arc<dyn AfterErrorVerifier>>,
}

impl RuntimeControls {
    pub fn create(
        config: RuntimeConfig,
        events: EventBus,
        before_call: BeforeCallChain,
        after_success: Option<Arc<dyn AfterSuccessVerifier>>,
        after_error: Option<Arc<dyn AfterErrorVerifier>>,
    ) -> Self {
        let circuits = CircuitBreakerRegistry::new(config.tenant.clone());
        Self {
            config,
            events,
            circuits,
            before_call,
            after_success,
            after_error,
        }
    }

    /// Clear the budget counter for `run_key` (or `"default"` when absent).
    pub async fn reset(&self, run_key: Option<&str>) {
        let key = run_key
            .filter(|k| !k.trim().is_empty())
            .unwrap_or("default");
        budget::reset(self.config.state_store.as_ref(), key).await;
    }

    /// Build a [`WrappedCall`] bound to `tool_name`: a reusable callable that
    /// resolves the call context from a caller-chosen `Args` value via
    /// `resolver` before forwarding to [`RuntimeControls::run`].
    pub fn wrap<Args>(
        &self,
        tool_name: impl Into<String>,
        resolver: Arc<dyn ParamResolver<Args>>,
    ) -> WrappedCall<Args>
    where
        Args: Clone + Serialize + Send + Sync + 'static,
    {
        WrappedCall::new(tool_name, resolver)
    }

    /// Run `executor` under the full gate pipeline.
    pub async fn run<F, Fut>(&self, context: CallContext, executor: F) -> ToolCallResult<Value>
    where
        F: Fn(ExecutionRuntime) -> Fut,
        Fut: Future<Output = ToolCallResult<Value>>,
    {
        if context.tool_name.trim().is_empty() {
            return Err(ToolCallError::validation("tool_name is required"));
        }

        let run_key = normalized_run_key(&context);
        let span = tracing::info_span!(
            "tool_call",
            tool_name = %context.tool_name,
            run_key = %run_key,
            tenant = %self.config.tenant,
        );
        self.run_inner(context, run_key, executor).instrument(span).await
    }

    async fn run_inner<F, Fut>(
        &self,
        context: CallContext,
        run_key: String,
        executor: F,
    ) -> ToolCallResult<Value>
    where
        F: Fn(ExecutionRuntime) -> Fut,
        Fut: Future<Output = ToolCallResult<Value>>,
    {
        let store = self.config.state_store.as_ref();
        let destination_host = normalize_destination_host(context.destination.as_deref());
        let effective = resolve_effective_config(&self.config, &context.tool_name, Some(&destination_host));
        let timeout_ms = context.timeout_override_ms.unwrap_or(effective.timeout_ms);

        if let Err(err) = self.enforce_policy(&context, &destination_host).await {
            return Err(err);
        }
        tracing::debug!("policy allowed");

        let before_ctx = BeforeCallContext {
            tool_name: context.tool_name.clone(),
            run_key: run_key.clone(),
            destination: context.destination.clone(),
            action: context.action.clone(),
            args: context.args.clone(),
        };
        if let VerifierDecision::Reject { reason } = self.before_call.run(&before_ctx).await {
            self.events.emit(
                EventKind::VerifierRejected,
                Some(&context.tool_name),
                Some(&run_key),
                serde_json::json!({"phase": VerifierPhase::BeforeCall.as_str(), "reason": reason}),
            );
            return Err(ToolCallError::invalid_request(reason));
        }

        if let Some(idempotency_key) = &context.idempotency_key {
            if let Some(outcome) = idempotency::find_replay(
                store,
                &self.config.idempotency,
                &run_key,
                &context.tool_name,
                idempotency_key,
            )
            .await
            {
                self.events.emit(
                    EventKind::IdempotencyReplay,
                    Some(&context.tool_name),
                    Some(&run_key),
                    serde_json::json!({"idempotencyKey": idempotency_key}),
                );
                return outcome_value_to_result(outcome);
            }
        }

        if let Some(budget_err) = self.enforce_budget(&context, &run_key).await {
            return Err(budget_err);
        }

        if let Err(block) = loop_breaker::check_pre_call(
            store,
            &effective.loop_breaker,
            &context.tool_name,
            context.args.as_ref(),
        )
        .await
        {
            let message = match block {
                LoopBlock::Stopped => "loop breaker stopped this fingerprint",
                LoopBlock::Quarantined => "loop breaker quarantined this fingerprint",
            };
            return Err(ToolCallError::invalid_request(message));
        }

        let lock_guard = match self.acquire_lock(&context, &run_key, timeout_ms).await {
            Ok(guard) => guard,
            Err(err) => return Err(err),
        };

        let result = self
            .run_retry_loop(&context, &run_key, &destination_host, &effective, timeout_ms, executor)
            .await;

        if let Some((owner, resource_key)) = lock_guard {
            lock::release(store, &resource_key, &owner).await;
        }

        result
    }

    async fn enforce_policy(
        &self,
        context: &CallContext,
        destination_host: &str,
    ) -> Result<(), ToolCallError> {
        let decision = policy::evaluate(
            &self.config.policy_rules,
            &context.tool_name,
            Some(destination_host),
            context.action.as_deref(),
        );

        let dry_run = matches!(self.config.policy_mode, policy::PolicyMode::DryRun);

        match decision {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny { rule_id, reason } => {
                if dry_run {
                    self.events.emit(
                        EventKind::PolicyDryRun,
                        Some(&context.tool_name),
                        context.run_key.as_deref(),
                        serde_json::json!({"ruleId": rule_id, "reason": reason, "action": "deny"}),
                    );
                    Ok(())
                } else {
                    tracing::warn!(rule_id = %rule_id, %reason, "policy denied");
                    self.events.emit(
                        EventKind::PolicyDenied,
                        Some(&context.tool_name),
                        context.run_key.as_deref(),
                        serde_json::json!({"ruleId": rule_id, "reason": reason}),
                    );
                    Err(ToolCallError::unauthorized(reason))
                }
            }
            PolicyDecision::RequireApproval { rule_id, reason } => {
                self.events.emit(
                    EventKind::PolicyApprovalRequired,
                    Some(&context.tool_name),
                    context.run_key.as_deref(),
                    serde_json::json!({"ruleId": rule_id, "reason": reason.clone()}),
                );
                let approved = match &self.config.approval_handler {
                    Some(handler) => {
                        handler
                            .approve(&ApprovalContext {
                                tool_name: context.tool_name.clone(),
                                destination: context.destination.clone(),
                                action: context.action.clone(),
                                rule_id: rule_id.clone(),
                                reason: reason.clone(),
                            })
                            .await
                    }
                    None => false,
                };
                if approved {
                    self.events.emit(
                        EventKind::PolicyApproved,
                        Some(&context.tool_name),
                        context.run_key.as_deref(),
                        serde_json::json!({"ruleId": rule_id}),
                    );
                    Ok(())
                } else if dry_run {
                    Ok(())
                } else {
                    self.events.emit(
                        EventKind::PolicyDenied,
                        Some(&context.tool_name),
                        context.run_key.as_deref(),
                        serde_json::json!({"ruleId": rule_id, "reason": "approval denied"}),
                    );
                    Err(ToolCallError::unauthorized(reason))
                }
            }
        }
    }

    async fn enforce_budget(&self, context: &CallContext, run_key: &str) -> Option<ToolCallError> {
        let Some(max_calls) = self.config.max_calls else {
            return None;
        };
        let policy = budget::BudgetPolicy {
            enabled: true,
            max_calls,
        };
        let count = budget::increment(self.config.state_store.as_ref(), &policy, run_key).await;
        if budget::is_exhausted(&policy, count) {
            tracing::warn!(count, max_calls, "tool-call budget exhausted");
            self.events.emit(
                EventKind::BudgetStop,
                Some(&context.tool_name),
                Some(run_key),
                serde_json::json!({"count": count, "maxCalls": max_calls}),
            );
            Some(ToolCallError::invalid_request("tool-call budget exhausted"))
        } else {
            None
        }
    }

    /// Returns `Some((owner, resource_key))` on success, for release after the
    /// retry loop; `None` when no resource key was supplied or concurrency
    /// control is disabled.
    async fn acquire_lock(
        &self,
        context: &CallContext,
        run_key: &str,
        timeout_ms: i64,
    ) -> Result<Option<(String, String)>, ToolCallError> {
        let Some(resource_key) = &context.resource_key else {
            return Ok(None);
        };
        if !self.config.concurrency.enabled {
            return Ok(None);
        }

        let outcome = lock::acquire(
            self.config.state_store.as_ref(),
            resource_key,
            &self.config.concurrency,
            timeout_ms,
        )
        .await?;

        match outcome {
            AcquireOutcome::Acquired { owner, waited } => {
                if waited {
                    tracing::info!(resource_key, "lock acquired after wait");
                    self.events.emit(
                        EventKind::ConcurrencyWait,
                        Some(&context.tool_name),
                        Some(run_key),
                        serde_json::json!({"resourceKey": resource_key}),
                    );
                }
                Ok(Some((owner, resource_key.clone())))
            }
            AcquireOutcome::Rejected | AcquireOutcome::WaitTimedOut => {
                tracing::warn!(resource_key, "lock acquisition rejected");
                self.events.emit(
                    EventKind::ConcurrencyRejected,
                    Some(&context.tool_name),
                    Some(run_key),
                    serde_json::json!({"resourceKey": resource_key}),
                );
                Err(ToolCallError::invalid_request("resource is locked by another caller"))
            }
        }
    }

    async fn run_retry_loop<F, Fut>(
        &self,
        context: &CallContext,
        run_key: &str,
        destination_host: &str,
        effective: &crate::config::EffectiveConfig,
        timeout_ms: i64,
        executor: F,
    ) -> ToolCallResult<Value>
    where
        F: Fn(ExecutionRuntime) -> Fut,
        Fut: Future<Output = ToolCallResult<Value>>,
    {
        let store = self.config.state_store.as_ref();
        let mut attempt: u32 = 1;

        loop {
            let attempt_result = self
                .execute_one_attempt(context, destination_host, effective, timeout_ms, &executor)
                .await;

            match attempt_result {
                Ok(value) => {
                    let after_ctx = AfterSuccessContext {
                        tool_name: context.tool_name.clone(),
                        run_key: run_key.to_string(),
                        result: value.clone(),
                    };
                    if let Some(verifier) = &self.after_success {
                        if let VerifierDecision::Reject { reason } = verifier.verify(&after_ctx).await {
                            self.events.emit(
                                EventKind::VerifierRejected,
                                Some(&context.tool_name),
                                Some(run_key),
                                serde_json::json!({"phase": VerifierPhase::AfterSuccess.as_str(), "reason": reason}),
                            );
                            return Err(ToolCallError::invalid_request(reason));
                        }
                    }

                    loop_breaker::record_outcome(
                        store,
                        &effective.loop_breaker,
                        &context.tool_name,
                        context.args.as_ref(),
                        &OutcomeSummary {
                            ok: true,
                            status_code: None,
                            code: None,
                            message: None,
                            data: Some(&value),
                        },
                    )
                    .await;

                    if let Some(idempotency_key) = &context.idempotency_key {
                        idempotency::store_outcome(
                            store,
                            &self.config.idempotency,
                            run_key,
                            &context.tool_name,
                            idempotency_key,
                            serde_json::json!({"ok": true, "result": value}),
                        )
                        .await;
                    }

                    return Ok(value);
                }
                Err(mut error) => {
                    if let Some(verifier) = &self.after_error {
                        let after_ctx = AfterErrorContext {
                            tool_name: context.tool_name.clone(),
                            run_key: run_key.to_string(),
                            error_message: error.message().to_string(),
                            error_code: error.code().to_string(),
                        };
                        match verifier.verify(&after_ctx).await {
                            AfterErrorOutcome::Passthrough => {}
                            AfterErrorOutcome::Replace(replacement) => error = replacement,
                            AfterErrorOutcome::Reject { reason } => {
                                self.events.emit(
                                    EventKind::VerifierRejected,
                                    Some(&context.tool_name),
                                    Some(run_key),
                                    serde_json::json!({"phase": VerifierPhase::AfterError.as_str(), "reason": reason}),
                                );
                                error = ToolCallError::invalid_request(reason);
                            }
                        }
                    }

                    let decision = resolve_retry_decision(
                        &effective.retry,
                        self.config.retry_classifier.as_deref(),
                        &error,
                        attempt,
                        &context.tool_name,
                        Some(destination_host),
                        context.action.as_deref(),
                    )
                    .await;

                    if decision.retryable && !error.cancelled_by_caller() {
                        tracing::warn!(attempt, reason = ?decision.reason, "retrying failed attempt");
                        self.events.emit(
                            EventKind::Retry,
                            Some(&context.tool_name),
                            Some(run_key),
                            serde_json::json!({"attempt": attempt, "reason": decision.reason}),
                        );
                        let delay = compute_backoff_delay(&effective.retry, attempt, decision.delay_ms);
                        if sleep_with_abort(delay, context.caller_signal.as_ref()).await.is_err() {
                            let cancelled = ToolCallError::cancelled("cancelled by caller during backoff");
                            self.record_terminal_failure(context, run_key, store, effective, &cancelled).await;
                            return Err(cancelled);
                        }
                        attempt += 1;
                        continue;
                    }

                    self.record_terminal_failure(context, run_key, store, effective, &error).await;
                    return Err(error);
                }
            }
        }
    }

    async fn record_terminal_failure(
        &self,
        context: &CallContext,
        run_key: &str,
        store: &dyn crate::state::StateStore,
        effective: &crate::config::EffectiveConfig,
        error: &ToolCallError,
    ) {
        let transition = loop_breaker::record_outcome(
            store,
            &effective.loop_breaker,
            &context.tool_name,
            context.args.as_ref(),
            &OutcomeSummary {
                ok: false,
                status_code: error.status_code(),
                code: Some(&error.code().to_string()),
                message: Some(error.message()),
                data: None,
            },
        )
        .await;

        match transition {
            LoopTransition::EnteredWarning => {
                tracing::info!(tool_name = %context.tool_name, "loop breaker entered warning band");
                self.events.emit(
                    EventKind::LoopWarning,
                    Some(&context.tool_name),
                    Some(run_key),
                    serde_json::Value::Null,
                )
            }
            LoopTransition::EnteredQuarantine => {
                tracing::info!(tool_name = %context.tool_name, "loop breaker quarantined fingerprint");
                self.events.emit(
                    EventKind::LoopQuarantine,
                    Some(&context.tool_name),
                    Some(run_key),
                    serde_json::Value::Null,
                )
            }
            LoopTransition::EnteredStop => {
                tracing::info!(tool_name = %context.tool_name, "loop breaker stopped fingerprint");
                self.events.emit(
                    EventKind::LoopStop,
                    Some(&context.tool_name),
                    Some(run_key),
                    serde_json::Value::Null,
                )
            }
            LoopTransition::None => {}
        }

        if self.config.idempotency.include_errors {
            if let Some(idempotency_key) = &context.idempotency_key {
                idempotency::store_outcome(
                    store,
                    &self.config.idempotency,
                    run_key,
                    &context.tool_name,
                    idempotency_key,
                    serde_json::json!({"ok": false, "code": error.code().to_string(), "message": error.message()}),
                )
                .await;
            }
        }
    }

    async fn execute_one_attempt<F, Fut>(
        &self,
        context: &CallContext,
        destination_host: &str,
        effective: &crate::config::EffectiveConfig,
        timeout_ms: i64,
        executor: &F,
    ) -> ToolCallResult<Value>
    where
        F: Fn(ExecutionRuntime) -> Fut,
        Fut: Future<Output = ToolCallResult<Value>>,
    {
        if self
            .circuits
            .check(&effective.circuit_breaker, &context.tool_name, destination_host)
            .is_err()
        {
            return Err(ToolCallError::network("circuit breaker open"));
        }

        let run_signal = RunSignal::new(timeout_ms, context.caller_signal.clone());
        let runtime = ExecutionRuntime {
            signal: run_signal.signal.clone(),
        };

        let raced = race(&run_signal.signal, executor(runtime)).await;

        let result = match raced {
            Ok(inner) => inner,
            Err(aborted) => match aborted.0 {
                AbortReason::Caller(_) => Err(ToolCallError::cancelled("cancelled by caller")),
                AbortReason::Timeout => Err(ToolCallError::network("timed out")),
            },
        };

        let normalized = result.map_err(normalize_failure);

        let opened = self.circuits.record(
            &effective.circuit_breaker,
            &context.tool_name,
            destination_host,
            normalized.is_err(),
        );
        if opened {
            tracing::info!(destination = destination_host, "circuit breaker opened");
            self.events.emit(
                EventKind::CircuitOpen,
                Some(&context.tool_name),
                None,
                serde_json::json!({"destination": destination_host}),
            );
        }

        normalized
    }
}

/// Call-context fields resolved from a caller-chosen `Args` value by a
/// [`ParamResolver`].
#[derive(Debug, Clone, Default)]
pub struct ResolvedCallParams {
    pub run_key: Option<String>,
    pub destination: Option<String>,
    pub action: Option<String>,
    pub idempotency_key: Option<String>,
    pub resource_key: Option<String>,
}

/// Derives [`ResolvedCallParams`] from an `Args` value ahead of a wrapped
/// call. Async so a resolver can perform a state lookup or hash computation
/// (e.g. deriving an idempotency key from the args) before `run` is invoked.
#[async_trait]
pub trait ParamResolver<Args>: Send + Sync {
    async fn resolve(&self, args: &Args) -> ResolvedCallParams;
}

/// A reusable callable bound to one tool name, returned by
/// [`RuntimeControls::wrap`]. Each invocation resolves the call context from
/// `args` and forwards both the context and the raw `args` to `run`.
pub struct WrappedCall<Args> {
    tool_name: String,
    resolver: Arc<dyn ParamResolver<Args>>,
}

impl<Args> WrappedCall<Args>
where
    Args: Clone + Serialize + Send + Sync + 'static,
{
    fn new(tool_name: impl Into<String>, resolver: Arc<dyn ParamResolver<Args>>) -> Self {
        Self {
            tool_name: tool_name.into(),
            resolver,
        }
    }

    /// Resolve the call context from `args`, then run `executor` under the
    /// full gate pipeline, forwarding `args` back to the executor.
    pub async fn call<F, Fut>(
        &self,
        controls: &RuntimeControls,
        args: Args,
        executor: F,
    ) -> ToolCallResult<Value>
    where
        F: Fn(ExecutionRuntime, Args) -> Fut,
        Fut: Future<Output = ToolCallResult<Value>>,
    {
        let params = self.resolver.resolve(&args).await;
        let context = CallContext {
            tool_name: self.tool_name.clone(),
            run_key: params.run_key,
            destination: params.destination,
            action: params.action,
            args: serde_json::to_value(&args).ok(),
            idempotency_key: params.idempotency_key,
            resource_key: params.resource_key,
            caller_signal: None,
            timeout_override_ms: None,
        };
        let args_for_executor = args;
        controls
            .run(context, move |rt| executor(rt, args_for_executor.clone()))
            .await
    }
}

fn outcome_value_to_result(outcome: Value) -> ToolCallResult<Value> {
    let ok = outcome.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
    if ok {
        Ok(outcome.get("result").cloned().unwrap_or(Value::Null))
    } else {
        let message = outcome
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("replayed failure")
            .to_string();
        Err(ToolCallError::unknown(message))
    }
}
