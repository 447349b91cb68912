//! Policy rule model and specificity-ranked evaluator.
//!
//! Pure matching/ranking logic lives here; the orchestrator owns event
//! emission, dry-run handling, and the approval-handler call (see
//! `orchestrator::enforce_policy`) so this module stays testable without an
//! event bus.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a matching rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Deny,
    RequireApproval,
}

impl PolicyAction {
    fn strictness(self) -> u8 {
        match self {
            PolicyAction::Allow => 0,
            PolicyAction::RequireApproval => 1,
            PolicyAction::Deny => 2,
        }
    }
}

/// Whether the policy gate blocks on non-allow decisions or only observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyMode {
    Enforce,
    DryRun,
}

impl Default for PolicyMode {
    fn default() -> Self {
        PolicyMode::Enforce
    }
}

/// A single policy rule. Absent constraints are treated as "matches anything".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub action: PolicyAction,
    pub tools: Option<Vec<String>>,
    pub destinations: Option<Vec<String>>,
    pub action_prefixes: Option<Vec<String>>,
    pub reason: Option<String>,
}

impl PolicyRule {
    pub fn allow(id: impl Into<String>) -> Self {
        PolicyRule {
            id: id.into(),
            action: PolicyAction::Allow,
            tools: None,
            destinations: None,
            action_prefixes: None,
            reason: None,
        }
    }

    pub fn deny(id: impl Into<String>) -> Self {
        PolicyRule {
            id: id.into(),
            action: PolicyAction::Deny,
            tools: None,
            destinations: None,
            action_prefixes: None,
            reason: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_destinations(mut self, destinations: Vec<String>) -> Self {
        self.destinations = Some(destinations);
        self
    }

    pub fn with_action_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.action_prefixes = Some(prefixes);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Tool-name pattern specificity: exact(2) > `prefix*`(1) > `*`/absent(0).
fn tool_pattern_specificity(pattern: &str) -> u8 {
    if pattern == "*" {
        0
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        if prefix.is_empty() {
            0
        } else {
            1
        }
    } else {
        2
    }
}

fn tool_pattern_matches(pattern: &str, tool_name: &str) -> bool {
    if pattern == "*" {
        true
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        tool_name.starts_with(prefix)
    } else {
        pattern == tool_name
    }
}

/// Destination host pattern specificity: exact(2) > `*.suffix`(1) > `*`/absent(0).
fn destination_pattern_specificity(pattern: &str) -> u8 {
    if pattern == "*" {
        0
    } else if pattern.starts_with("*.") {
        1
    } else {
        2
    }
}

fn destination_pattern_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        true
    } else if let Some(suffix) = pattern.strip_prefix("*.") {
        host == suffix || host.ends_with(&format!(".{suffix}"))
    } else {
        pattern == host
    }
}

/// `(tool, destination, action_prefix, strictness)` — compared as a tuple;
/// the index is compared separately so the evaluator can apply the
/// lower-index-wins tie-break documented for complete ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RuleRank {
    tool_specificity: u8,
    destination_specificity: u8,
    action_prefix_specificity: u8,
    strictness: u8,
}

fn match_rank(
    rule: &PolicyRule,
    tool_name: &str,
    destination_host: Option<&str>,
    action: Option<&str>,
) -> Option<RuleRank> {
    let tool_specificity = match &rule.tools {
        None => 0,
        Some(patterns) => {
            let mut best: Option<u8> = None;
            for pattern in patterns {
                if tool_pattern_matches(pattern, tool_name) {
                    let spec = tool_pattern_specificity(pattern);
                    best = Some(best.map_or(spec, |b| b.max(spec)));
                }
            }
            best?
        }
    };

    let destination_specificity = match &rule.destinations {
        None => 0,
        Some(patterns) => {
            let host = destination_host.unwrap_or("default");
            let mut best: Option<u8> = None;
            for pattern in patterns {
                if destination_pattern_matches(pattern, host) {
                    let spec = destination_pattern_specificity(pattern);
                    best = Some(best.map_or(spec, |b| b.max(spec)));
                }
            }
            best?
        }
    };

    let action_prefix_specificity = match &rule.action_prefixes {
        None => 0,
        Some(prefixes) => {
            let action = action.unwrap_or("");
            if prefixes.iter().any(|p| action.starts_with(p.as_str())) {
                1
            } else {
                return None;
            }
        }
    };

    Some(RuleRank {
        tool_specificity,
        destination_specificity,
        action_prefix_specificity,
        strictness: rule.action.strictness(),
    })
}

/// The effective decision for one call after rule evaluation.
#[derive(Debug, Clone)]
pub enum PolicyDecision {
    Allow,
    Deny { rule_id: String, reason: String },
    RequireApproval { rule_id: String, reason: String },
}

/// Evaluate all rules against a call and return the highest-ranked matching
/// decision, or `Allow` when no rule matches (default-open, matching the
/// source's behavior of only restricting what an explicit rule covers).
pub fn evaluate(
    rules: &[PolicyRule],
    tool_name: &str,
    destination_host: Option<&str>,
    action: Option<&str>,
) -> PolicyDecision {
    let mut best: Option<(RuleRank, usize, &PolicyRule)> = None;

    for (index, rule) in rules.iter().enumerate() {
        let Some(rank) = match_rank(rule, tool_name, destination_host, action) else {
            continue;
        };
        best = match best {
            None => Some((rank, index, rule)),
            Some((best_rank, best_index, best_rule)) => {
                if rank > best_rank || (rank == best_rank && index < best_index) {
                    Some((rank, index, rule))
                } else {
                    Some((best_rank, best_index, best_rule))
                }
            }
        };
    }

    match best {
        None => PolicyDecision::Allow,
        Some((_, _, rule)) => match rule.action {
            PolicyAction::Allow => PolicyDecision::Allow,
            PolicyAction::Deny => PolicyDecision::Deny {
                rule_id: rule.id.clone(),
                reason: rule
                    .reason
                    .clone()
                    .unwrap_or_else(|| "denied by policy".to_string()),
            },
            PolicyAction::RequireApproval => PolicyDecision::RequireApproval {
                rule_id: rule.id.clone(),
                reason: rule
                    .reason
                    .clone()
                    .unwrap_or_else(|| "approval required".to_string()),
            },
        },
    }
}

/// Context handed to an [`ApprovalHandler`] when a `require_approval` rule matches.
#[derive(Debug, Clone)]
pub struct ApprovalContext {
    pub tool_name: String,
    pub destination: Option<String>,
    pub action: Option<String>,
    pub rule_id: String,
    pub reason: String,
}

/// Implemented by callers who want to gate `require_approval` rules on a
/// human or external decision, mirroring the reference crate's `Critic`
/// trait shape for human-in-the-loop review.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn approve(&self, context: &ApprovalContext) -> bool;
}

/// Approval handler that always approves — useful in tests and for callers
/// who configure `require_approval` rules purely for audit visibility.
pub struct AlwaysApprove;

#[async_trait]
impl ApprovalHandler for AlwaysApprove {
    async fn approve(&self, _context: &ApprovalContext) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_allow_then_exact_deny_picks_the_more_specific_rule() {
        let rules = vec![
            PolicyRule::allow("allow-all").with_tools(vec!["*".into()]),
            PolicyRule::deny("deny-exact")
                .with_tools(vec!["http".into()])
                .with_destinations(vec!["api.acme.local".into()]),
        ];

        let decision = evaluate(&rules, "http", Some("api.acme.local"), None);
        assert!(matches!(decision, PolicyDecision::Deny { .. }));

        let decision = evaluate(&rules, "http", Some("other.local"), None);
        assert!(matches!(decision, PolicyDecision::Allow));
    }

    #[test]
    fn complete_tie_resolves_to_earlier_index() {
        let rules = vec![
            PolicyRule::allow("first").with_tools(vec!["http".into()]),
            PolicyRule::deny("second").with_tools(vec!["http".into()]),
        ];
        let decision = evaluate(&rules, "http", None, None);
        assert!(matches!(decision, PolicyDecision::Allow));
    }

    #[test]
    fn prefix_pattern_is_less_specific_than_exact() {
        let rules = vec![
            PolicyRule::allow("prefix").with_tools(vec!["http_*".into()]),
            PolicyRule::deny("exact").with_tools(vec!["http_get".into()]),
        ];
        let decision = evaluate(&rules, "http_get", None, None);
        assert!(matches!(decision, PolicyDecision::Deny { .. }));
    }

    #[test]
    fn no_matching_rule_defaults_to_allow() {
        let rules = vec![PolicyRule::deny("only-ftp").with_tools(vec!["ftp".into()])];
        let decision = evaluate(&rules, "http", None, None);
        assert!(matches!(decision, PolicyDecision::Allow));
    }

    #[test]
    fn action_prefix_constraint_must_match_to_apply() {
        let rules = vec![PolicyRule::deny("writes-only")
            .with_tools(vec!["fs".into()])
            .with_action_prefixes(vec!["write".into()])];

        let decision = evaluate(&rules, "fs", None, Some("read_file"));
        assert!(matches!(decision, PolicyDecision::Allow));

        let decision = evaluate(&rules, "fs", None, Some("write_file"));
        assert!(matches!(decision, PolicyDecision::Deny { .. }));
    }

    #[test]
    fn destination_suffix_wildcard_matches_subdomains() {
        let rules = vec![PolicyRule::deny("internal").with_destinations(vec!["*.internal".into()])];
        let decision = evaluate(&rules, "http", Some("db.internal"), None);
        assert!(matches!(decision, PolicyDecision::Deny { .. }));
        let decision = evaluate(&rules, "http", Some("internal"), None);
        assert!(matches!(decision, PolicyDecision::Deny { .. }));
        let decision = evaluate(&rules, "http", Some("external.com"), None);
        assert!(matches!(decision, PolicyDecision::Allow));
    }

    #[tokio::test]
    async fn always_approve_handler_approves() {
        let handler = AlwaysApprove;
        let ctx = ApprovalContext {
            tool_name: "http".into(),
            destination: None,
            action: None,
            rule_id: "r1".into(),
            reason: "needs review".into(),
        };
        assert!(handler.approve(&ctx).await);
    }
}
