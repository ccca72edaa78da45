//! Threat signals and the adaptive policy table.
//!
//! Signals are kept per client key. The rapid-request signal comes from the
//! token bucket itself; the others are reported by the host.

use std::collections::VecDeque;

use dashmap::DashMap;
use serde::Serialize;

use crate::security::rate_limit::RateLimitPolicy;
use crate::vault::token::sha256_hex;

/// Window in which a bucket exhaustion counts as rapid requests.
pub const RAPID_REQUEST_WINDOW_MS: u64 = 1_000;

/// Window and threshold for repeated 2FA failures.
pub const TWO_FACTOR_FAILURE_WINDOW_MS: u64 = 15 * 60 * 1000;
pub const TWO_FACTOR_FAILURE_THRESHOLD: usize = 3;

/// Window and threshold for user-agent churn.
pub const USER_AGENT_WINDOW_MS: u64 = 10 * 60 * 1000;
pub const USER_AGENT_CHURN_THRESHOLD: usize = 3;

const MAX_TRACKED_USER_AGENTS: usize = 16;

/// A detected anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatPattern {
    RapidRequests,
    RepeatedTwoFactorFailures,
    UserAgentChurn,
}

impl ThreatPattern {
    /// Risk points contributed by this pattern.
    pub const fn points(self) -> u8 {
        match self {
            ThreatPattern::RapidRequests => 25,
            ThreatPattern::RepeatedTwoFactorFailures => 30,
            ThreatPattern::UserAgentChurn => 20,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ThreatPattern::RapidRequests => "rapid-requests",
            ThreatPattern::RepeatedTwoFactorFailures => "repeated-2fa-failures",
            ThreatPattern::UserAgentChurn => "user-agent-churn",
        }
    }
}

/// Result of `detect_suspicious_patterns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreatAssessment {
    pub suspicious: bool,
    pub patterns: Vec<ThreatPattern>,
    pub risk_score: u8,
}

impl ThreatAssessment {
    pub fn from_patterns(patterns: Vec<ThreatPattern>) -> Self {
        let risk_score = patterns
            .iter()
            .map(|p| u32::from(p.points()))
            .sum::<u32>()
            .min(100) as u8;
        Self {
            suspicious: risk_score > 50,
            patterns,
            risk_score,
        }
    }
}

/// Combine a host-supplied threat level with a risk score.
pub fn blended_threat_level(base_threat_level: f64, risk_score: u8) -> f64 {
    let base = if base_threat_level.is_finite() {
        base_threat_level.clamp(0.0, 1.0)
    } else {
        0.0
    };
    base + f64::from(risk_score) / 100.0 * 0.5
}

/// Map a threat level to a policy tier. Higher threat never widens the window.
pub fn policy_for_threat(threat_level: f64, default: RateLimitPolicy) -> RateLimitPolicy {
    if threat_level > 0.7 {
        RateLimitPolicy::new(5 * 60 * 1000, 10)
    } else if threat_level > 0.4 {
        RateLimitPolicy::new(10 * 60 * 1000, 30)
    } else if threat_level > 0.2 {
        RateLimitPolicy::new(15 * 60 * 1000, 100)
    } else {
        default
    }
}

/// Stable client key derived from IP and user agent.
pub fn fingerprint(ip: &str, user_agent: Option<&str>) -> String {
    sha256_hex(format!("{}|{}", ip, user_agent.unwrap_or("")).as_bytes())
}

#[derive(Debug, Default)]
struct ClientSignals {
    two_factor_failures: VecDeque<u64>,
    user_agents: Vec<(String, u64)>,
}

impl ClientSignals {
    fn prune(&mut self, now_ms: u64) {
        while let Some(&at) = self.two_factor_failures.front() {
            if now_ms.saturating_sub(at) > TWO_FACTOR_FAILURE_WINDOW_MS {
                self.two_factor_failures.pop_front();
            } else {
                break;
            }
        }
        self.user_agents
            .retain(|(_, seen)| now_ms.saturating_sub(*seen) <= USER_AGENT_WINDOW_MS);
    }

    fn is_empty(&self) -> bool {
        self.two_factor_failures.is_empty() && self.user_agents.is_empty()
    }
}

/// Per-client externally reported signals.
#[derive(Debug, Default)]
pub struct ThreatTracker {
    signals: DashMap<String, ClientSignals>,
}

impl ThreatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_two_factor_failure(&self, key: &str, now_ms: u64) {
        let mut signals = self.signals.entry(key.to_string()).or_default();
        signals.prune(now_ms);
        signals.two_factor_failures.push_back(now_ms);
    }

    /// Forget 2FA failures after a successful verification.
    pub fn clear_two_factor_failures(&self, key: &str) {
        if let Some(mut signals) = self.signals.get_mut(key) {
            signals.two_factor_failures.clear();
        }
    }

    pub fn observe_user_agent(&self, key: &str, user_agent: &str, now_ms: u64) {
        let mut signals = self.signals.entry(key.to_string()).or_default();
        signals.prune(now_ms);
        if let Some(slot) = signals
            .user_agents
            .iter_mut()
            .find(|(ua, _)| ua.as_str() == user_agent)
        {
            slot.1 = now_ms;
            return;
        }
        if signals.user_agents.len() >= MAX_TRACKED_USER_AGENTS {
            // Drop the least recently seen.
            if let Some(oldest) = signals
                .user_agents
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, seen))| *seen)
                .map(|(i, _)| i)
            {
                signals.user_agents.swap_remove(oldest);
            }
        }
        signals.user_agents.push((user_agent.to_string(), now_ms));
    }

    /// Reported patterns currently active for `key`.
    pub fn patterns(&self, key: &str, now_ms: u64) -> Vec<ThreatPattern> {
        let mut patterns = Vec::new();
        let Some(mut signals) = self.signals.get_mut(key) else {
            return patterns;
        };
        signals.prune(now_ms);
        if signals.two_factor_failures.len() >= TWO_FACTOR_FAILURE_THRESHOLD {
            patterns.push(ThreatPattern::RepeatedTwoFactorFailures);
        }
        if signals.user_agents.len() >= USER_AGENT_CHURN_THRESHOLD {
            patterns.push(ThreatPattern::UserAgentChurn);
        }
        patterns
    }

    pub fn remove(&self, key: &str) {
        self.signals.remove(key);
    }

    /// Drop clients with no signals left in their windows.
    pub fn purge_stale(&self, now_ms: u64) -> usize {
        let before = self.signals.len();
        self.signals.retain(|_, signals| {
            signals.prune(now_ms);
            !signals.is_empty()
        });
        before.saturating_sub(self.signals.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_and_threshold() {
        let a = ThreatAssessment::from_patterns(vec![ThreatPattern::RapidRequests]);
        assert_eq!(a.risk_score, 25);
        assert!(!a.suspicious);

        let b = ThreatAssessment::from_patterns(vec![
            ThreatPattern::RapidRequests,
            ThreatPattern::RepeatedTwoFactorFailures,
        ]);
        assert_eq!(b.risk_score, 55);
        assert!(b.suspicious);

        let c = ThreatAssessment::from_patterns(vec![
            ThreatPattern::RapidRequests,
            ThreatPattern::UserAgentChurn,
        ]);
        assert_eq!(c.risk_score, 45);
        assert!(!c.suspicious);
    }

    #[test]
    fn test_policy_tiers() {
        let default = RateLimitPolicy::DEFAULT;
        assert_eq!(policy_for_threat(0.0, default), default);
        assert_eq!(policy_for_threat(0.2, default), default);
        assert_eq!(
            policy_for_threat(0.3, default),
            RateLimitPolicy::new(900_000, 100)
        );
        assert_eq!(
            policy_for_threat(0.5, default),
            RateLimitPolicy::new(600_000, 30)
        );
        assert_eq!(
            policy_for_threat(0.71, default),
            RateLimitPolicy::new(300_000, 10)
        );
    }

    #[test]
    fn test_policy_is_monotone_in_threat() {
        let default = RateLimitPolicy::DEFAULT;
        let mut previous = f64::INFINITY;
        for step in 0..=120 {
            let level = f64::from(step) / 100.0;
            let rate = policy_for_threat(level, default).refill_per_ms();
            assert!(rate <= previous, "rate widened at level {level}");
            previous = rate;
        }
    }

    #[test]
    fn test_blended_level() {
        assert_eq!(blended_threat_level(0.0, 0), 0.0);
        assert!((blended_threat_level(0.2, 100) - 0.7).abs() < 1e-9);
        assert_eq!(blended_threat_level(f64::NAN, 50), 0.25);
        assert_eq!(blended_threat_level(5.0, 0), 1.0);
    }

    #[test]
    fn test_two_factor_failures_within_window() {
        let tracker = ThreatTracker::new();
        for i in 0..3 {
            tracker.report_two_factor_failure("1.2.3.4", i * 1_000);
        }
        assert_eq!(
            tracker.patterns("1.2.3.4", 3_000),
            vec![ThreatPattern::RepeatedTwoFactorFailures]
        );
        // Past the window the failures age out.
        assert!(tracker
            .patterns("1.2.3.4", 3_000 + TWO_FACTOR_FAILURE_WINDOW_MS)
            .is_empty());
    }

    #[test]
    fn test_clear_two_factor_failures() {
        let tracker = ThreatTracker::new();
        for _ in 0..3 {
            tracker.report_two_factor_failure("k", 0);
        }
        tracker.clear_two_factor_failures("k");
        assert!(tracker.patterns("k", 0).is_empty());
    }

    #[test]
    fn test_user_agent_churn() {
        let tracker = ThreatTracker::new();
        tracker.observe_user_agent("k", "curl/8", 0);
        tracker.observe_user_agent("k", "curl/8", 10);
        tracker.observe_user_agent("k", "python-requests", 20);
        assert!(tracker.patterns("k", 30).is_empty());
        tracker.observe_user_agent("k", "Go-http-client", 40);
        assert_eq!(tracker.patterns("k", 50), vec![ThreatPattern::UserAgentChurn]);
    }

    #[test]
    fn test_tracked_user_agents_are_capped() {
        let tracker = ThreatTracker::new();
        for i in 0..40u64 {
            tracker.observe_user_agent("k", &format!("agent-{i}"), i);
        }
        let count = tracker.signals.get("k").unwrap().user_agents.len();
        assert_eq!(count, MAX_TRACKED_USER_AGENTS);
    }

    #[test]
    fn test_purge_stale() {
        let tracker = ThreatTracker::new();
        tracker.observe_user_agent("old", "ua", 0);
        tracker.observe_user_agent("new", "ua", USER_AGENT_WINDOW_MS * 2);
        assert_eq!(tracker.purge_stale(USER_AGENT_WINDOW_MS * 2), 1);
        assert!(tracker.signals.contains_key("new"));
    }

    #[test]
    fn test_fingerprint_is_stable_and_distinct() {
        let a = fingerprint("1.1.1.1", Some("ua"));
        assert_eq!(a, fingerprint("1.1.1.1", Some("ua")));
        assert_ne!(a, fingerprint("1.1.1.1", Some("ub")));
        assert_eq!(a.len(), 64);
    }
}
