//! Path pattern matching.
//!
//! # Responsibilities
//! - Match request paths against exact, prefix or regex patterns
//! - Report the literal length used for longest-prefix-first ordering
//! - Apply the rule's rewrite to a matched path
//!
//! # Design Decisions
//! - Path matching is case-sensitive
//! - Prefix matching respects segment boundaries (`/api` does not match `/apix`)
//! - Regex patterns are compiled once, at registration

use regex::Regex;

use crate::config::MatchKind;

/// A compiled path pattern.
#[derive(Debug, Clone)]
pub enum PathPattern {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl PathPattern {
    pub fn compile(kind: MatchKind, pattern: &str) -> Result<Self, regex::Error> {
        Ok(match kind {
            MatchKind::Exact => PathPattern::Exact(pattern.to_string()),
            MatchKind::Prefix => PathPattern::Prefix(pattern.to_string()),
            MatchKind::Regex => PathPattern::Regex(Regex::new(pattern)?),
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(expected) => path == expected,
            PathPattern::Prefix(prefix) => prefix_matches(prefix, path),
            PathPattern::Regex(re) => re.is_match(path),
        }
    }

    /// Number of literal leading characters; longer wins.
    pub fn literal_len(&self) -> usize {
        match self {
            PathPattern::Exact(p) | PathPattern::Prefix(p) => p.len(),
            PathPattern::Regex(re) => literal_prefix(re.as_str()).len(),
        }
    }

    /// Rewrite `path` with `template`. Prefix patterns substitute the matched
    /// prefix, regex patterns expand capture groups, exact patterns replace
    /// the whole path.
    pub fn rewrite(&self, path: &str, template: &str) -> String {
        match self {
            PathPattern::Exact(_) => template.to_string(),
            PathPattern::Prefix(prefix) => {
                let rest = &path[prefix.len().min(path.len())..];
                join_paths(template, rest)
            }
            PathPattern::Regex(re) => re.replace(path, template).into_owned(),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PathPattern::Exact(p) | PathPattern::Prefix(p) => p,
            PathPattern::Regex(re) => re.as_str(),
        }
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    prefix.ends_with('/') || path.len() == prefix.len() || path.as_bytes()[prefix.len()] == b'/'
}

fn literal_prefix(pattern: &str) -> &str {
    let pattern = pattern.strip_prefix('^').unwrap_or(pattern);
    let end = pattern
        .char_indices()
        .find(|(_, c)| "\\.+*?()|[]{}^$".contains(*c))
        .map(|(i, _)| i)
        .unwrap_or(pattern.len());
    &pattern[..end]
}

fn join_paths(base: &str, rest: &str) -> String {
    let joined = match (base.ends_with('/'), rest.starts_with('/')) {
        (true, true) => format!("{}{}", base, &rest[1..]),
        (false, false) if !rest.is_empty() => format!("{}/{}", base, rest),
        _ => format!("{}{}", base, rest),
    };
    if joined.is_empty() {
        "/".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_segment_boundary() {
        let p = PathPattern::compile(MatchKind::Prefix, "/api").unwrap();
        assert!(p.matches("/api"));
        assert!(p.matches("/api/v1"));
        assert!(!p.matches("/apix"));
        assert!(!p.matches("/images"));

        let root = PathPattern::compile(MatchKind::Prefix, "/").unwrap();
        assert!(root.matches("/anything"));
    }

    #[test]
    fn test_exact() {
        let p = PathPattern::compile(MatchKind::Exact, "/status").unwrap();
        assert!(p.matches("/status"));
        assert!(!p.matches("/status/x"));
    }

    #[test]
    fn test_regex_literal_len() {
        let p = PathPattern::compile(MatchKind::Regex, r"^/users/(\d+)/profile$").unwrap();
        assert_eq!(p.literal_len(), "/users/".len());
        assert!(p.matches("/users/42/profile"));
        assert!(!p.matches("/users/abc/profile"));
    }

    #[test]
    fn test_invalid_regex() {
        assert!(PathPattern::compile(MatchKind::Regex, "(unclosed").is_err());
    }

    #[test]
    fn test_rewrite() {
        let p = PathPattern::compile(MatchKind::Prefix, "/api/chat").unwrap();
        assert_eq!(p.rewrite("/api/chat/rooms/1", "/v2"), "/v2/rooms/1");
        assert_eq!(p.rewrite("/api/chat", "/"), "/");
        assert_eq!(p.rewrite("/api/chat/x", "/"), "/x");

        let r = PathPattern::compile(MatchKind::Regex, r"^/u/(\d+)$").unwrap();
        assert_eq!(r.rewrite("/u/7", "/users/$1"), "/users/7");

        let e = PathPattern::compile(MatchKind::Exact, "/old").unwrap();
        assert_eq!(e.rewrite("/old", "/new"), "/new");
    }
}
