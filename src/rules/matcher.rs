use crate::rules::{Rule, RuleSet};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of resolving a request against the rule set.
pub struct RuleMatch {
    pub rule: Arc<Rule>,
    /// Captured path parameters; the wildcard remainder is bound to `"*"`.
    pub params: HashMap<String, String>,
}

/// Resolves `(method, path)` to at most one rule.
///
/// The set was sorted priority-descending (stable on ties) at compile time,
/// so matching is a linear scan over anchored regexes that returns the first
/// hit. Hundreds of rules stay comfortably sub-millisecond; the only
/// per-call allocation is the params map of the winning rule.
pub struct RulesMatcher {
    set: Arc<RuleSet>,
}

impl RulesMatcher {
    pub fn new(set: Arc<RuleSet>) -> Self {
        Self { set }
    }

    pub fn rule_count(&self) -> usize {
        self.set.len()
    }

    /// Resolve a request. Method comparison is case-insensitive (methods are
    /// uppercased at compile time); an empty method set matches any method.
    pub fn match_request(&self, method: &str, path: &str) -> Option<RuleMatch> {
        let method_upper = method.to_uppercase();

        for rule in self.set.rules() {
            if !rule.methods.is_empty() && !rule.methods.iter().any(|m| m == &method_upper) {
                continue;
            }
            if let Some(captured) = rule.compiled.match_path(path) {
                return Some(RuleMatch {
                    rule: rule.clone(),
                    params: captured.into_iter().collect(),
                });
            }
        }
        None
    }
}
