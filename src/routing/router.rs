//! Route table.
//!
//! # Responsibilities
//! - Store compiled route rules
//! - Look up the matching rule for a path
//! - Return the matched rule and the (possibly rewritten) upstream path
//!
//! # Design Decisions
//! - Longest literal prefix first; ties by registration order
//! - Registering an identical rule is a no-op
//! - Re-registering a pattern with new settings updates it in place and keeps its order
//! - Explicit no-match rather than a silent default

use std::sync::Arc;

use crate::config::RouteConfig;
use crate::routing::matcher::PathPattern;

#[derive(Debug, Clone)]
struct RouteRule {
    pattern: PathPattern,
    route: Arc<RouteConfig>,
    order: usize,
}

/// Result of registering a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Added,
    Unchanged,
    Updated,
}

/// A matched rule.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<RouteConfig>,
    /// Path to send upstream.
    pub upstream_path: String,
}

/// Ordered set of route rules.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
    next_order: usize,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(routes: &[RouteConfig]) -> Result<Self, regex::Error> {
        let mut table = Self::new();
        for route in routes {
            table.register(route.clone())?;
        }
        Ok(table)
    }

    pub fn register(&mut self, route: RouteConfig) -> Result<RegisterOutcome, regex::Error> {
        if let Some(existing) = self
            .rules
            .iter_mut()
            .find(|r| r.route.path == route.path && r.route.match_kind == route.match_kind)
        {
            if *existing.route == route {
                return Ok(RegisterOutcome::Unchanged);
            }
            existing.route = Arc::new(route);
            return Ok(RegisterOutcome::Updated);
        }

        let pattern = PathPattern::compile(route.match_kind, &route.path)?;
        self.rules.push(RouteRule {
            pattern,
            route: Arc::new(route),
            order: self.next_order,
        });
        self.next_order += 1;
        self.rules.sort_by(|a, b| {
            b.pattern
                .literal_len()
                .cmp(&a.pattern.literal_len())
                .then(a.order.cmp(&b.order))
        });
        Ok(RegisterOutcome::Added)
    }

    pub fn match_path(&self, path: &str) -> Option<RouteMatch> {
        let rule = self.rules.iter().find(|r| r.pattern.matches(path))?;
        let upstream_path = match &rule.route.rewrite {
            Some(template) => rule.pattern.rewrite(path, template),
            None => path.to_string(),
        };
        Some(RouteMatch {
            route: rule.route.clone(),
            upstream_path,
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in match order.
    pub fn routes(&self) -> impl Iterator<Item = &RouteConfig> {
        self.rules.iter().map(|r| r.route.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchKind;

    fn route(path: &str, kind: MatchKind, service: &str) -> RouteConfig {
        RouteConfig {
            path: path.into(),
            match_kind: kind,
            service: service.into(),
            rewrite: None,
            priority: Default::default(),
            websocket: false,
            connection_kind: Default::default(),
        }
    }

    #[test]
    fn test_longest_prefix_first() {
        let table = RouteTable::from_config(&[
            route("/", MatchKind::Prefix, "default"),
            route("/api", MatchKind::Prefix, "api"),
            route("/api/chat", MatchKind::Prefix, "chat"),
        ])
        .unwrap();

        assert_eq!(table.match_path("/api/chat/1").unwrap().route.service, "chat");
        assert_eq!(table.match_path("/api/other").unwrap().route.service, "api");
        assert_eq!(table.match_path("/x").unwrap().route.service, "default");
    }

    #[test]
    fn test_ties_by_registration_order() {
        let table = RouteTable::from_config(&[
            route("/a/b", MatchKind::Prefix, "first"),
            route("^/a/b.*", MatchKind::Regex, "second"),
        ])
        .unwrap();
        assert_eq!(table.match_path("/a/b/c").unwrap().route.service, "first");
    }

    #[test]
    fn test_no_match() {
        let table = RouteTable::from_config(&[route("/api", MatchKind::Prefix, "api")]).unwrap();
        assert!(table.match_path("/other").is_none());
    }

    #[test]
    fn test_idempotent_registration() {
        let mut table = RouteTable::new();
        let r = route("/api", MatchKind::Prefix, "api");
        assert_eq!(table.register(r.clone()).unwrap(), RegisterOutcome::Added);
        table.register(route("/", MatchKind::Prefix, "default")).unwrap();

        let before: Vec<String> = table.routes().map(|r| r.service.clone()).collect();
        assert_eq!(table.register(r.clone()).unwrap(), RegisterOutcome::Unchanged);
        assert_eq!(table.register(r).unwrap(), RegisterOutcome::Unchanged);
        let after: Vec<String> = table.routes().map(|r| r.service.clone()).collect();

        assert_eq!(table.len(), 2);
        assert_eq!(before, after);
    }

    #[test]
    fn test_update_in_place() {
        let mut table = RouteTable::new();
        table.register(route("/api", MatchKind::Prefix, "api")).unwrap();
        assert_eq!(
            table.register(route("/api", MatchKind::Prefix, "api-v2")).unwrap(),
            RegisterOutcome::Updated
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.match_path("/api").unwrap().route.service, "api-v2");
    }

    #[test]
    fn test_rewrite_applied() {
        let mut r = route("/api/chat", MatchKind::Prefix, "chat");
        r.rewrite = Some("/v1".into());
        let table = RouteTable::from_config(&[r]).unwrap();
        assert_eq!(table.match_path("/api/chat/rooms").unwrap().upstream_path, "/v1/rooms");
    }
}
