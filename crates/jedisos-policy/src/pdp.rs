//! Policy decision point: evaluates per-request tool-call admissibility.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// `{allowed_tools, blocked_tools, max_requests_per_minute, channel_rules}`.
/// Empty `allowed_tools` means "all except blocked".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub allowed_tools: HashSet<String>,
    #[serde(default)]
    pub blocked_tools: HashSet<String>,
    pub max_requests_per_minute: u32,
    #[serde(default)]
    pub channel_rules: HashMap<String, String>,
}

impl Policy {
    pub fn allow_all(max_requests_per_minute: u32) -> Self {
        Self { max_requests_per_minute, ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Allow,
    Deny(String),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// What is being evaluated: either a specific tool call or the request
/// itself (subject = "message").
#[derive(Debug, Clone)]
pub struct PdpRequest {
    pub user_id: String,
    pub channel: String,
    pub subject: String,
    pub is_tool: bool,
}

const WINDOW: Duration = Duration::from_secs(60);

/// Per-user sliding-window request counters, shared across the process.
#[derive(Default)]
struct RateLimiter {
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    fn record_and_check(&self, user_id: &str, max_per_minute: u32) -> bool {
        if max_per_minute == 0 {
            return true;
        }
        let mut hits = self.hits.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();
        let entry = hits.entry(user_id.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < WINDOW);
        if entry.len() as u32 >= max_per_minute {
            return false;
        }
        entry.push(now);
        true
    }
}

/// Evaluates [`PdpRequest`]s against a [`Policy`]. Construction is cheap;
/// the rate limiter state lives for the lifetime of the PDP instance, so
/// callers should keep one long-lived instance per process.
pub struct PolicyDecisionPoint {
    policy: Policy,
    limiter: RateLimiter,
}

impl PolicyDecisionPoint {
    pub fn new(policy: Policy) -> Self {
        Self { policy, limiter: RateLimiter::default() }
    }

    /// Short-circuit rule evaluation: blocked → deny, non-empty allow-list
    /// miss → deny, rate limit exceeded → deny, else allow.
    pub fn evaluate(&self, request: &PdpRequest) -> Decision {
        if request.is_tool && self.policy.blocked_tools.contains(&request.subject) {
            return Decision::Deny("tool is blocked".to_string());
        }
        if request.is_tool
            && !self.policy.allowed_tools.is_empty()
            && !self.policy.allowed_tools.contains(&request.subject)
        {
            return Decision::Deny("tool not in allow-list".to_string());
        }
        if !self
            .limiter
            .record_and_check(&request.user_id, self.policy.max_requests_per_minute)
        {
            return Decision::Deny("rate limit".to_string());
        }
        Decision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(user: &str, subject: &str, is_tool: bool) -> PdpRequest {
        PdpRequest { user_id: user.to_string(), channel: "cli".to_string(), subject: subject.to_string(), is_tool }
    }

    #[test]
    fn blocked_tool_denies() {
        let mut policy = Policy::allow_all(100);
        policy.blocked_tools.insert("shell_exec".to_string());
        let pdp = PolicyDecisionPoint::new(policy);
        let decision = pdp.evaluate(&req("u1", "shell_exec", true));
        assert_eq!(decision, Decision::Deny("tool is blocked".to_string()));
    }

    #[test]
    fn non_empty_allow_list_miss_denies() {
        let mut policy = Policy::allow_all(100);
        policy.allowed_tools.insert("current_time".to_string());
        let pdp = PolicyDecisionPoint::new(policy);
        let decision = pdp.evaluate(&req("u1", "shell_exec", true));
        assert_eq!(decision, Decision::Deny("tool not in allow-list".to_string()));
        assert!(pdp.evaluate(&req("u1", "current_time", true)).is_allow());
    }

    #[test]
    fn empty_allow_list_means_all_but_blocked() {
        let policy = Policy::allow_all(100);
        let pdp = PolicyDecisionPoint::new(policy);
        assert!(pdp.evaluate(&req("u1", "anything", true)).is_allow());
    }

    #[test]
    fn message_subject_is_never_checked_against_tool_lists() {
        let mut policy = Policy::allow_all(100);
        policy.blocked_tools.insert("message".to_string());
        let pdp = PolicyDecisionPoint::new(policy);
        assert!(pdp.evaluate(&req("u1", "message", false)).is_allow());
    }

    #[test]
    fn rate_limit_boundary() {
        let policy = Policy::allow_all(2);
        let pdp = PolicyDecisionPoint::new(policy);
        assert!(pdp.evaluate(&req("u1", "message", false)).is_allow());
        assert!(pdp.evaluate(&req("u1", "message", false)).is_allow());
        let third = pdp.evaluate(&req("u1", "message", false));
        assert_eq!(third, Decision::Deny("rate limit".to_string()));
    }

    #[test]
    fn rate_limit_is_per_user() {
        let policy = Policy::allow_all(1);
        let pdp = PolicyDecisionPoint::new(policy);
        assert!(pdp.evaluate(&req("u1", "message", false)).is_allow());
        assert!(pdp.evaluate(&req("u2", "message", false)).is_allow());
    }
}
