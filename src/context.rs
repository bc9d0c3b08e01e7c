//! Per-request context.
//!
//! # Responsibilities
//! - Carry the priority class and bypass flag set by the upstream classifier
//! - Carry the caller's auth context untouched (the core never inspects it)
//! - Track the retry attempt counter and the outer request deadline
//!
//! # Design Decisions
//! - Priority and bypass are trusted as-is; the gateway never invents them
//! - Context is immutable after creation except for the attempt counter

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the priority class.
pub const X_PRIORITY_CLASS: &str = "x-priority-class";
/// Header carrying the circuit bypass flag.
pub const X_BYPASS_CIRCUIT: &str = "x-bypass-circuit";
/// Header carrying the correlation id.
pub const X_CORRELATION_ID: &str = "x-correlation-id";

/// Priority tag attached to every request and connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    #[default]
    Normal,
    Elevated,
    Critical,
}

impl PriorityClass {
    pub const ALL: [PriorityClass; 3] = [
        PriorityClass::Normal,
        PriorityClass::Elevated,
        PriorityClass::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::Normal => "normal",
            PriorityClass::Elevated => "elevated",
            PriorityClass::Critical => "critical",
        }
    }

    /// Weight multiplier applied by the priority-boosted strategy.
    pub fn boost(&self) -> f64 {
        match self {
            PriorityClass::Normal => 1.0,
            PriorityClass::Elevated => 1.5,
            PriorityClass::Critical => 2.0,
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(PriorityClass::Normal),
            "elevated" => Ok(PriorityClass::Elevated),
            "critical" => Ok(PriorityClass::Critical),
            other => Err(format!("unknown priority class '{}'", other)),
        }
    }
}

/// Opaque authentication context forwarded to backends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    /// Raw `Authorization` header value, if any.
    pub authorization: Option<String>,
    /// Caller identity as asserted upstream (`x-user-id`).
    pub user_id: Option<String>,
}

/// Outer deadline for a request.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self { at: Instant::now() + budget }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Context created at pipeline entry and discarded at response time.
#[derive(Debug, Clone)]
pub struct RequestContext {
    correlation_id: String,
    auth: AuthContext,
    priority: PriorityClass,
    bypass_circuit: bool,
    attempt: u32,
    deadline: Deadline,
}

impl RequestContext {
    pub fn new(
        correlation_id: Option<String>,
        auth: AuthContext,
        priority: PriorityClass,
        bypass_circuit: bool,
        deadline: Deadline,
    ) -> Self {
        let correlation_id = correlation_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            correlation_id,
            auth,
            priority,
            bypass_circuit,
            attempt: 0,
            deadline,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub fn priority(&self) -> PriorityClass {
        self.priority
    }

    /// Bypass is honoured only for critical traffic.
    pub fn bypass_circuit(&self) -> bool {
        self.bypass_circuit && self.priority == PriorityClass::Critical
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Advance the attempt counter, returning the new attempt number.
    pub fn next_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }
}

/// Parse a boolean header value ("true"/"1"/"yes").
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_parse() {
        assert_eq!("critical".parse::<PriorityClass>().unwrap(), PriorityClass::Critical);
        assert_eq!(" Elevated ".parse::<PriorityClass>().unwrap(), PriorityClass::Elevated);
        assert!("urgent".parse::<PriorityClass>().is_err());
    }

    #[test]
    fn test_bypass_only_for_critical() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let ctx = RequestContext::new(None, AuthContext::default(), PriorityClass::Normal, true, deadline);
        assert!(!ctx.bypass_circuit());

        let ctx = RequestContext::new(None, AuthContext::default(), PriorityClass::Critical, true, deadline);
        assert!(ctx.bypass_circuit());
    }

    #[test]
    fn test_correlation_id_reused_or_generated() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let ctx = RequestContext::new(Some("abc".into()), AuthContext::default(), PriorityClass::Normal, false, deadline);
        assert_eq!(ctx.correlation_id(), "abc");

        let ctx = RequestContext::new(Some(String::new()), AuthContext::default(), PriorityClass::Normal, false, deadline);
        assert_eq!(ctx.correlation_id().len(), 36);
    }

    #[test]
    fn test_attempt_counter() {
        let mut ctx = RequestContext::new(None, AuthContext::default(), PriorityClass::Normal, false, Deadline::after(Duration::from_secs(1)));
        assert_eq!(ctx.attempt(), 0);
        assert_eq!(ctx.next_attempt(), 1);
        assert_eq!(ctx.next_attempt(), 2);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }
}
