use regex::Regex;
use std::fmt;

/// A path pattern compiled to an anchored regex.
///
/// Grammar, per segment:
/// - literal: matched verbatim (dots and other regex metacharacters escaped)
/// - `:name`: one non-empty segment, captured under `name`
/// - `*`: the rest of the path, terminal position only, captured under `"*"`
///
/// Compilation rejects anything else so that `match_path` never has to think
/// about malformed patterns.
#[derive(Debug)]
pub struct CompiledPattern {
    regex: Regex,
    /// Capture names in group order. The wildcard, if present, is the last
    /// entry and is stored as `"*"`.
    param_names: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PatternError {
    NotAbsolute,
    WildcardNotTerminal,
    EmptyParamName,
    InvalidParamName(String),
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternError::NotAbsolute => write!(f, "pattern must start with '/'"),
            PatternError::WildcardNotTerminal => {
                write!(f, "wildcard '*' may only appear as the final segment")
            }
            PatternError::EmptyParamName => write!(f, "parameter name must not be empty"),
            PatternError::InvalidParamName(name) => {
                write!(f, "invalid parameter name {name:?}")
            }
        }
    }
}

impl std::error::Error for PatternError {}

fn valid_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl CompiledPattern {
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let Some(rest) = pattern.strip_prefix('/') else {
            return Err(PatternError::NotAbsolute);
        };

        let segments: Vec<&str> = rest.split('/').collect();
        let mut src = String::with_capacity(pattern.len() + 16);
        src.push('^');
        let mut param_names = Vec::new();

        for (i, seg) in segments.iter().enumerate() {
            let last = i == segments.len() - 1;
            src.push('/');
            if *seg == "*" {
                if !last {
                    return Err(PatternError::WildcardNotTerminal);
                }
                // Swallows the remainder, further slashes included.
                src.push_str("(.*)");
                param_names.push("*".to_string());
            } else if let Some(name) = seg.strip_prefix(':') {
                if name.is_empty() {
                    return Err(PatternError::EmptyParamName);
                }
                if !valid_param_name(name) {
                    return Err(PatternError::InvalidParamName(name.to_string()));
                }
                src.push_str("([^/]+)");
                param_names.push(name.to_string());
            } else {
                if seg.contains('*') {
                    return Err(PatternError::WildcardNotTerminal);
                }
                src.push_str(&regex::escape(seg));
            }
        }
        src.push('$');

        // The grammar only emits escaped literals and fixed groups, so the
        // regex source is valid by construction.
        let regex = Regex::new(&src).expect("generated pattern regex");
        Ok(Self { regex, param_names })
    }

    /// Match a full request path. Returns captured params (wildcard under
    /// `"*"`) or `None`. Allocates only when the pattern has captures.
    pub fn match_path(&self, path: &str) -> Option<Vec<(String, String)>> {
        let caps = self.regex.captures(path)?;
        let mut params = Vec::with_capacity(self.param_names.len());
        for (idx, name) in self.param_names.iter().enumerate() {
            if let Some(m) = caps.get(idx + 1) {
                params.push((name.clone(), m.as_str().to_string()));
            }
        }
        Some(params)
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pattern: &str, path: &str) -> Option<Vec<(String, String)>> {
        CompiledPattern::compile(pattern).unwrap().match_path(path)
    }

    #[test]
    fn test_literal_exact() {
        let p = CompiledPattern::compile("/api/health").unwrap();
        assert!(p.is_match("/api/health"));
        assert!(!p.is_match("/api/healthz"));
        assert!(!p.is_match("/api/health/"));
        assert!(!p.is_match("/api"));
    }

    #[test]
    fn test_dots_are_literal() {
        let p = CompiledPattern::compile("/static/app.js").unwrap();
        assert!(p.is_match("/static/app.js"));
        assert!(!p.is_match("/static/appxjs"));
    }

    #[test]
    fn test_param_capture() {
        let got = params("/api/users/:id", "/api/users/42").unwrap();
        assert_eq!(got, vec![("id".to_string(), "42".to_string())]);
    }

    #[test]
    fn test_param_rejects_empty_segment() {
        let p = CompiledPattern::compile("/api/users/:id").unwrap();
        assert!(!p.is_match("/api/users/"));
        assert!(!p.is_match("/api/users//x"));
    }

    #[test]
    fn test_param_single_segment_only() {
        let p = CompiledPattern::compile("/api/users/:id").unwrap();
        assert!(!p.is_match("/api/users/42/posts"));
    }

    #[test]
    fn test_multiple_params() {
        let got = params("/api/:tenant/users/:id", "/api/acme/users/7").unwrap();
        assert_eq!(
            got,
            vec![
                ("tenant".to_string(), "acme".to_string()),
                ("id".to_string(), "7".to_string()),
            ]
        );
    }

    #[test]
    fn test_wildcard_captures_remainder() {
        let got = params("/api/*", "/api/v1/users/42").unwrap();
        assert_eq!(got, vec![("*".to_string(), "v1/users/42".to_string())]);
    }

    #[test]
    fn test_wildcard_matches_empty_remainder() {
        let p = CompiledPattern::compile("/api/*").unwrap();
        assert!(p.is_match("/api/"));
        assert!(!p.is_match("/api"));
    }

    #[test]
    fn test_wildcard_must_be_terminal() {
        assert_eq!(
            CompiledPattern::compile("/api/*/users").unwrap_err(),
            PatternError::WildcardNotTerminal
        );
        assert_eq!(
            CompiledPattern::compile("/api/v*").unwrap_err(),
            PatternError::WildcardNotTerminal
        );
    }

    #[test]
    fn test_must_start_with_slash() {
        assert_eq!(
            CompiledPattern::compile("api/users").unwrap_err(),
            PatternError::NotAbsolute
        );
    }

    #[test]
    fn test_param_name_validation() {
        assert_eq!(
            CompiledPattern::compile("/api/:").unwrap_err(),
            PatternError::EmptyParamName
        );
        assert_eq!(
            CompiledPattern::compile("/api/:1id").unwrap_err(),
            PatternError::InvalidParamName("1id".to_string())
        );
        assert_eq!(
            CompiledPattern::compile("/api/:user-id").unwrap_err(),
            PatternError::InvalidParamName("user-id".to_string())
        );
        assert!(CompiledPattern::compile("/api/:_id").is_ok());
        assert!(CompiledPattern::compile("/api/:userId2").is_ok());
    }

    #[test]
    fn test_root_pattern() {
        let p = CompiledPattern::compile("/").unwrap();
        assert!(p.is_match("/"));
        assert!(!p.is_match("/x"));
    }
}
