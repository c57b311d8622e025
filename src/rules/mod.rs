pub mod matcher;
pub mod pattern;

pub use matcher::{RuleMatch, RulesMatcher};

use pattern::CompiledPattern;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A rule definition as submitted by the admin collaborator (and by the
/// optional preload file). Compiled into a [`Rule`] before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,

    pub pattern: String,

    /// Uppercase HTTP methods; empty means any method.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Higher wins when several rules match the same request.
    #[serde(default)]
    pub priority: i32,

    /// Maximum requests per window per identity.
    pub limit: u64,

    /// Humantime window length, e.g. "60s".
    pub window: String,

    /// "ip" (default) or "header".
    #[serde(default = "default_identify_by")]
    pub identify_by: String,

    /// Required when `identify_by = "header"`.
    #[serde(default)]
    pub header_name: Option<String>,
}

fn default_identify_by() -> String {
    "ip".to_string()
}

/// How a rule derives the identity it counts against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifyBy {
    Ip,
    /// Case-insensitive header name; absent/empty values fall back to the
    /// client identity.
    Header(String),
}

/// An immutable compiled rule. Requests that captured an `Arc<Rule>` keep
/// using it even after the set it came from has been swapped out.
pub struct Rule {
    pub name: String,
    pub pattern: String,
    pub methods: Vec<String>,
    pub priority: i32,
    pub limit: u64,
    pub window: Duration,
    pub identify_by: IdentifyBy,
    pub(crate) compiled: CompiledPattern,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("priority", &self.priority)
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish()
    }
}

impl Rule {
    /// Render back into the serde-facing form (admin GET /rules).
    pub fn to_config(&self) -> RuleConfig {
        RuleConfig {
            name: self.name.clone(),
            pattern: self.pattern.clone(),
            methods: self.methods.clone(),
            priority: self.priority,
            limit: self.limit,
            window: humantime::format_duration(self.window).to_string(),
            identify_by: match self.identify_by {
                IdentifyBy::Ip => "ip".to_string(),
                IdentifyBy::Header(_) => "header".to_string(),
            },
            header_name: match &self.identify_by {
                IdentifyBy::Ip => None,
                IdentifyBy::Header(name) => Some(name.clone()),
            },
        }
    }
}

#[derive(Debug)]
pub struct RuleError {
    /// Name of the rule that failed compilation.
    pub rule: String,
    pub reason: String,
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid rule {:?}: {}", self.rule, self.reason)
    }
}

impl std::error::Error for RuleError {}

/// A compiled, priority-ordered rule collection. Immutable once built; the
/// gateway swaps whole sets atomically.
#[derive(Default, Debug)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    /// Compile a submitted collection. The whole set is rejected on the first
    /// invalid rule, naming it. Ordering is priority-descending, stable by
    /// submission order on ties.
    pub fn compile(configs: &[RuleConfig]) -> Result<Self, RuleError> {
        let mut rules = Vec::with_capacity(configs.len());

        for cfg in configs {
            let err = |reason: String| RuleError {
                rule: cfg.name.clone(),
                reason,
            };

            if cfg.name.is_empty() {
                return Err(err("name must not be empty".into()));
            }
            if cfg.limit == 0 {
                return Err(err("limit must be positive".into()));
            }
            let window = humantime::parse_duration(&cfg.window)
                .map_err(|e| err(format!("window: {e}")))?;
            if window.is_zero() {
                return Err(err("window must be positive".into()));
            }

            let identify_by = match cfg.identify_by.as_str() {
                "ip" => IdentifyBy::Ip,
                "header" => match cfg.header_name.as_deref().map(str::trim) {
                    Some(name) if !name.is_empty() => IdentifyBy::Header(name.to_string()),
                    _ => return Err(err("identify_by \"header\" requires header_name".into())),
                },
                other => return Err(err(format!("unknown identify_by {other:?}"))),
            };

            let compiled = CompiledPattern::compile(&cfg.pattern)
                .map_err(|e| err(format!("pattern: {e}")))?;

            rules.push(Arc::new(Rule {
                name: cfg.name.clone(),
                pattern: cfg.pattern.clone(),
                methods: cfg.methods.iter().map(|m| m.to_uppercase()).collect(),
                priority: cfg.priority,
                limit: cfg.limit,
                window,
                identify_by,
                compiled,
            }));
        }

        // Stable sort: equal priorities keep submission order.
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));

        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
