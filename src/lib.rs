//! Composable reliability and safety control layer for agent tool calls.
//!
//! [`orchestrator::RuntimeControls`] wraps an arbitrary async tool call with
//! a fixed pipeline of gates — policy, verifiers, idempotency replay,
//! budget, loop breaking, locking, circuit breaking, timeout/cancellation,
//! and retry — so that callers write one executor closure and get all of it
//! for free. [`safety::apply_agent_logic_safety`] layers an additional
//! injection guard, exit-condition tracker, and intent allowlist on top of a
//! base configuration.

pub mod abort;
pub mod budget;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod failure;
pub mod hash;
pub mod idempotency;
pub mod lock;
pub mod loop_breaker;
pub mod orchestrator;
pub mod policy;
pub mod retry;
pub mod safety;
pub mod state;
pub mod verifier;

pub use config::{ConfigOverride, EffectiveConfig, RuntimeConfig, RuntimeConfigBuilder};
pub use error::{ConfigError, ErrorCode, ToolCallError, ToolCallResult};
pub use orchestrator::{
    CallContext, ExecutionRuntime, ParamResolver, ResolvedCallParams, RuntimeControls, WrappedCall,
};
pub use safety::{apply_agent_logic_safety, SafetyConfig};
