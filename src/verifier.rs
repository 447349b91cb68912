//! Before-call, after-success, and after-error verifier hooks.
//!
//! Any non-allow decision from a verifier becomes an `INVALID_REQUEST`
//! failure (or, for the after-error hook, may replace the in-flight error
//! entirely — this is how the safety composer standardizes rejection
//! reasons without the orchestrator needing to know about it).

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::ToolCallError;

/// Which of the three hooks rejected a call — carried on
/// `verifier_rejected` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierPhase {
    BeforeCall,
    AfterSuccess,
    AfterError,
}

impl VerifierPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            VerifierPhase::BeforeCall => "before_call",
            VerifierPhase::AfterSuccess => "after_success",
            VerifierPhase::AfterError => "after_error",
        }
    }
}

/// A verifier's decision about whether a call may proceed.
#[derive(Debug, Clone)]
pub enum VerifierDecision {
    Allow,
    Reject { reason: String },
}

impl VerifierDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        VerifierDecision::Reject {
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, VerifierDecision::Allow)
    }
}

/// Context handed to a before-call verifier.
#[derive(Debug, Clone)]
pub struct BeforeCallContext {
    pub tool_name: String,
    pub run_key: String,
    pub destination: Option<String>,
    pub action: Option<String>,
    pub args: Option<Value>,
}

/// Context handed to an after-success verifier.
#[derive(Debug, Clone)]
pub struct AfterSuccessContext {
    pub tool_name: String,
    pub run_key: String,
    pub result: Value,
}

/// Context handed to an after-error verifier. Returning `Allow` leaves the
/// error untouched; the verifier communicates a replacement error via
/// `replacement` rather than via the decision, since "allow the failure to
/// propagate" and "reject the call" are semantically different from the
/// orchestrator's point of view for this hook alone.
#[derive(Debug, Clone)]
pub struct AfterErrorContext {
    pub tool_name: String,
    pub run_key: String,
    pub error_message: String,
    pub error_code: String,
}

#[async_trait]
pub trait BeforeCallVerifier: Send + Sync {
    async fn verify(&self, context: &BeforeCallContext) -> VerifierDecision;
}

#[async_trait]
pub trait AfterSuccessVerifier: Send + Sync {
    async fn verify(&self, context: &AfterSuccessContext) -> VerifierDecision;
}

/// After-error verifiers may replace the error with a standardized one
/// (used by the safety composer) in addition to allowing or rejecting.
#[async_trait]
pub trait AfterErrorVerifier: Send + Sync {
    async fn verify(&self, context: &AfterErrorContext) -> AfterErrorOutcome;
}

#[derive(Debug, Clone)]
pub enum AfterErrorOutcome {
    /// Let the original error propagate unchanged.
    Passthrough,
    /// Replace the original error with this one.
    Replace(ToolCallError),
    /// Reject independently of the original error (verifier-originated rejection).
    Reject { reason: String },
}

/// An ordered chain of verifiers for one hook. Evaluated in order; the first
/// rejection short-circuits the rest — this is what lets the safety
/// composer's injection guard run after a caller-supplied before-call
/// verifier without either one needing to know about the other.
#[derive(Clone, Default)]
pub struct BeforeCallChain {
    verifiers: Vec<Arc<dyn BeforeCallVerifier>>,
}

impl BeforeCallChain {
    pub fn new(verifiers: Vec<Arc<dyn BeforeCallVerifier>>) -> Self {
        Self { verifiers }
    }

    pub fn push(&mut self, verifier: Arc<dyn BeforeCallVerifier>) {
        self.verifiers.push(verifier);
    }

    pub async fn run(&self, context: &BeforeCallContext) -> VerifierDecision {
        for verifier in &self.verifiers {
            let decision = verifier.verify(context).await;
            if !decision.is_allow() {
                return decision;
            }
        }
        VerifierDecision::Allow
    }
}
