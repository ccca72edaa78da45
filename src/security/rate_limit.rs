//! Token-bucket admission control with adaptive policy tiers.
//!
//! # Design Decisions
//! - Continuous refill: tokens accrue at `max_requests / window_ms` per ms
//! - Refill and consume happen under the bucket's shard lock
//! - Settings sit behind an `ArcSwap` so hot reload never blocks requests

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitSettings;
use crate::observability::metrics;
use crate::security::blocklist::{BlockDuration, BlockedIp, IpBlocklist};
use crate::security::threat::{
    blended_threat_level, policy_for_threat, ThreatAssessment, ThreatPattern, ThreatTracker,
    RAPID_REQUEST_WINDOW_MS,
};

/// Window length and request allowance for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitPolicy {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl RateLimitPolicy {
    pub const DEFAULT: RateLimitPolicy = RateLimitPolicy::new(15 * 60 * 1000, 100);

    pub const fn new(window_ms: u64, max_requests: u32) -> Self {
        Self {
            window_ms,
            max_requests,
        }
    }

    /// Replace a zero window or zero allowance with the default policy.
    pub fn sanitized(self) -> Self {
        if self.window_ms == 0 || self.max_requests == 0 {
            Self::DEFAULT
        } else {
            self
        }
    }

    pub fn capacity(&self) -> f64 {
        f64::from(self.max_requests)
    }

    pub fn refill_per_ms(&self) -> f64 {
        self.capacity() / self.window_ms as f64
    }

    /// Whole seconds needed to accrue `tokens`.
    fn secs_to_accrue(&self, tokens: f64) -> u64 {
        let ms = tokens * self.window_ms as f64 / self.capacity();
        (ms / 1000.0).ceil() as u64
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<&RateLimitSettings> for RateLimitPolicy {
    fn from(settings: &RateLimitSettings) -> Self {
        RateLimitPolicy::new(settings.window_ms, settings.max_requests).sanitized()
    }
}

/// Outcome of a single bucket check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_seconds: u64,
}

/// Per-client token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill_ms: u64,
    last_seen_ms: u64,
    exhausted_at_ms: Option<u64>,
}

impl TokenBucket {
    fn new(capacity: f64, now_ms: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill_ms: now_ms,
            last_seen_ms: now_ms,
            exhausted_at_ms: None,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self, policy: &RateLimitPolicy, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        let accrued = elapsed as f64 * policy.capacity() / policy.window_ms as f64;
        self.tokens = (self.tokens + accrued).clamp(0.0, policy.capacity());
        self.last_refill_ms = self.last_refill_ms.max(now_ms);
    }

    fn try_acquire(&mut self, policy: &RateLimitPolicy, now_ms: u64) -> RateLimitDecision {
        self.refill(policy, now_ms);
        self.last_seen_ms = self.last_seen_ms.max(now_ms);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            if self.tokens < 1.0 {
                self.exhausted_at_ms = Some(now_ms);
            }
            RateLimitDecision {
                allowed: true,
                remaining: self.tokens.floor() as u32,
                reset_seconds: policy.secs_to_accrue(policy.capacity() - self.tokens),
            }
        } else {
            self.exhausted_at_ms = Some(now_ms);
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_seconds: policy.secs_to_accrue(1.0 - self.tokens).max(1),
            }
        }
    }

    fn exhausted_recently(&self, now_ms: u64) -> bool {
        self.exhausted_at_ms
            .is_some_and(|at| now_ms.saturating_sub(at) <= RAPID_REQUEST_WINDOW_MS)
    }
}

/// Request attributes the limiter looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub ip: &'a str,
    pub user_agent: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    Blocked,
    RateLimited,
}

impl DenialReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            DenialReason::Blocked => "blocked",
            DenialReason::RateLimited => "rate_limited",
        }
    }
}

/// Outcome of `check_request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AdmissionDecision {
    Allowed {
        remaining: u32,
        reset_seconds: u64,
    },
    Denied {
        reason: DenialReason,
        /// `None` for a permanent block.
        retry_after_secs: Option<u64>,
    },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allowed { .. })
    }
}

/// Counters for the current stats window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub allowed: u64,
    pub limited: u64,
    pub blocked: u64,
    pub window_started_ms: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    allowed: AtomicU64,
    limited: AtomicU64,
    blocked: AtomicU64,
    window_started_ms: AtomicU64,
}

/// What a `cleanup` pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub expired_blocks: usize,
    pub idle_buckets: usize,
    pub stale_signals: usize,
}

/// Admission controller shared by every request handler.
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    blocklist: IpBlocklist,
    threats: ThreatTracker,
    settings: ArcSwap<RateLimitSettings>,
    stats: StatsCounters,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("buckets", &self.buckets.len())
            .field("blocked", &self.blocklist.len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: RateLimitSettings, clock: Arc<dyn Clock>) -> Self {
        let stats = StatsCounters::default();
        stats.window_started_ms.store(clock.now_ms(), Ordering::Relaxed);
        Self {
            buckets: DashMap::new(),
            blocklist: IpBlocklist::new(),
            threats: ThreatTracker::new(),
            settings: ArcSwap::from_pointee(settings),
            stats,
            clock,
        }
    }

    /// Swap in reloaded settings. Existing buckets keep their tokens.
    pub fn apply_settings(&self, settings: RateLimitSettings) {
        tracing::info!(
            window_ms = settings.window_ms,
            max_requests = settings.max_requests,
            adaptive = settings.adaptive,
            "Rate limit settings updated"
        );
        self.settings.store(Arc::new(settings));
    }

    pub fn settings(&self) -> Arc<RateLimitSettings> {
        self.settings.load_full()
    }

    pub fn default_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::from(self.settings.load().as_ref())
    }

    /// Spend one token from `client_key`'s bucket under `policy`.
    pub fn check_rate_limit(&self, client_key: &str, policy: RateLimitPolicy) -> RateLimitDecision {
        let policy = policy.sanitized();
        let now = self.clock.now_ms();
        let mut bucket = self
            .buckets
            .entry(client_key.to_string())
            .or_insert_with(|| TokenBucket::new(policy.capacity(), now));
        bucket.try_acquire(&policy, now)
    }

    /// Current bucket state for `client_key`, if one exists.
    pub fn bucket(&self, client_key: &str) -> Option<TokenBucket> {
        self.buckets.get(client_key).map(|b| b.clone())
    }

    pub fn detect_suspicious_patterns(&self, client_key: &str) -> ThreatAssessment {
        let now = self.clock.now_ms();
        let mut patterns = Vec::new();
        if self
            .buckets
            .get(client_key)
            .is_some_and(|b| b.exhausted_recently(now))
        {
            patterns.push(ThreatPattern::RapidRequests);
        }
        patterns.extend(self.threats.patterns(client_key, now));
        ThreatAssessment::from_patterns(patterns)
    }

    pub fn get_adaptive_rate_limit(&self, client_key: &str, base_threat_level: f64) -> RateLimitPolicy {
        let assessment = self.detect_suspicious_patterns(client_key);
        let level = blended_threat_level(base_threat_level, assessment.risk_score);
        policy_for_threat(level, self.default_policy())
    }

    pub fn report_two_factor_failure(&self, client_key: &str) {
        self.threats
            .report_two_factor_failure(client_key, self.clock.now_ms());
    }

    pub fn clear_two_factor_failures(&self, client_key: &str) {
        self.threats.clear_two_factor_failures(client_key);
    }

    pub fn observe_user_agent(&self, client_key: &str, user_agent: &str) {
        self.threats
            .observe_user_agent(client_key, user_agent, self.clock.now_ms());
    }

    /// Drop the bucket and threat signals for `client_key`.
    pub fn reset_rate_limit(&self, client_key: &str) {
        self.buckets.remove(client_key);
        self.threats.remove(client_key);
    }

    pub fn block_ip(&self, ip: &str, reason: &str, duration: BlockDuration) {
        self.blocklist.block(ip, reason, duration, self.clock.now_ms());
        tracing::warn!(ip = %ip, reason = %reason, duration = ?duration, "IP blocked");
        metrics::record_blocked_ips(self.blocklist.len());
    }

    pub fn unblock_ip(&self, ip: &str) -> bool {
        let removed = self.blocklist.unblock(ip, self.clock.now_ms());
        if removed {
            tracing::info!(ip = %ip, "IP unblocked");
        }
        metrics::record_blocked_ips(self.blocklist.len());
        removed
    }

    pub fn is_ip_blocked(&self, ip: &str) -> bool {
        self.blocklist.is_blocked(ip, self.clock.now_ms())
    }

    pub fn get_blocked_ips(&self) -> Vec<BlockedIp> {
        self.blocklist.list(self.clock.now_ms())
    }

    /// Composite per-request check: blocklist, signals, policy, bucket, auto-block.
    pub fn check_request(&self, request: &RequestContext<'_>) -> AdmissionDecision {
        let settings = self.settings.load();
        let ip = request.ip;

        if self.is_ip_blocked(ip) {
            return self.deny_blocked(ip);
        }

        if !settings.enabled {
            self.stats.allowed.fetch_add(1, Ordering::Relaxed);
            metrics::record_admission("allowed");
            return AdmissionDecision::Allowed {
                remaining: settings.max_requests,
                reset_seconds: 0,
            };
        }

        if let Some(user_agent) = request.user_agent {
            self.observe_user_agent(ip, user_agent);
        }

        let policy = if settings.adaptive {
            self.get_adaptive_rate_limit(ip, settings.base_threat_level)
        } else {
            RateLimitPolicy::from(settings.as_ref())
        };
        let decision = self.check_rate_limit(ip, policy);

        if settings.auto_block_enabled {
            let assessment = self.detect_suspicious_patterns(ip);
            if assessment.risk_score >= settings.auto_block_score {
                let patterns: Vec<&str> = assessment.patterns.iter().map(|p| p.as_str()).collect();
                self.block_ip(
                    ip,
                    &format!("automatic: {}", patterns.join(", ")),
                    BlockDuration::For(Duration::from_secs(settings.auto_block_secs)),
                );
                return self.deny_blocked(ip);
            }
        }

        if decision.allowed {
            self.stats.allowed.fetch_add(1, Ordering::Relaxed);
            metrics::record_admission("allowed");
            AdmissionDecision::Allowed {
                remaining: decision.remaining,
                reset_seconds: decision.reset_seconds,
            }
        } else {
            self.stats.limited.fetch_add(1, Ordering::Relaxed);
            metrics::record_admission("limited");
            metrics::record_rate_limited("token_bucket");
            tracing::debug!(ip = %ip, retry_after = decision.reset_seconds, "Rate limit exceeded");
            AdmissionDecision::Denied {
                reason: DenialReason::RateLimited,
                retry_after_secs: Some(decision.reset_seconds),
            }
        }
    }

    fn deny_blocked(&self, ip: &str) -> AdmissionDecision {
        self.stats.blocked.fetch_add(1, Ordering::Relaxed);
        metrics::record_admission("blocked");
        metrics::record_rate_limited("blocked");
        let now = self.clock.now_ms();
        let retry_after_secs = self
            .blocklist
            .get(ip, now)
            .and_then(|b| b.expires_at_ms)
            .map(|exp| exp.saturating_sub(now).div_ceil(1000));
        AdmissionDecision::Denied {
            reason: DenialReason::Blocked,
            retry_after_secs,
        }
    }

    /// Remove expired blocks, idle buckets and stale signals.
    pub fn cleanup(&self) -> CleanupSummary {
        let now = self.clock.now_ms();
        let settings = self.settings.load();
        // A bucket idle for a full window has refilled, so dropping it is lossless.
        let idle_ms = settings
            .idle_bucket_ttl_secs
            .saturating_mul(1000)
            .max(settings.window_ms);

        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_sub(bucket.last_seen_ms) < idle_ms);
        let summary = CleanupSummary {
            expired_blocks: self.blocklist.purge_expired(now),
            idle_buckets: before.saturating_sub(self.buckets.len()),
            stale_signals: self.threats.purge_stale(now),
        };
        metrics::record_blocked_ips(self.blocklist.len());
        tracing::debug!(
            expired_blocks = summary.expired_blocks,
            idle_buckets = summary.idle_buckets,
            stale_signals = summary.stale_signals,
            "Rate limiter cleanup complete"
        );
        summary
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            allowed: self.stats.allowed.load(Ordering::Relaxed),
            limited: self.stats.limited.load(Ordering::Relaxed),
            blocked: self.stats.blocked.load(Ordering::Relaxed),
            window_started_ms: self.stats.window_started_ms.load(Ordering::Relaxed),
        }
    }

    /// Start a new stats window, returning the one just closed.
    pub fn reset_stats_window(&self) -> AdmissionStats {
        let closed = AdmissionStats {
            allowed: self.stats.allowed.swap(0, Ordering::Relaxed),
            limited: self.stats.limited.swap(0, Ordering::Relaxed),
            blocked: self.stats.blocked.swap(0, Ordering::Relaxed),
            window_started_ms: self
                .stats
                .window_started_ms
                .swap(self.clock.now_ms(), Ordering::Relaxed),
        };
        tracing::debug!(
            allowed = closed.allowed,
            limited = closed.limited,
            blocked = closed.blocked,
            "Admission stats window closed"
        );
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    fn limiter_with(settings: RateLimitSettings) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (RateLimiter::with_clock(settings, clock.clone()), clock)
    }

    fn plain_settings() -> RateLimitSettings {
        RateLimitSettings {
            adaptive: false,
            auto_block_enabled: false,
            ..RateLimitSettings::default()
        }
    }

    #[test]
    fn test_burst_then_deny() {
        let (limiter, _) = limiter_with(plain_settings());
        let policy = RateLimitPolicy::new(60_000, 5);
        for expected in (0..5).rev() {
            let d = limiter.check_rate_limit("k", policy);
            assert!(d.allowed);
            assert_eq!(d.remaining, expected);
        }
        let denied = limiter.check_rate_limit("k", policy);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        // One token takes 12s at 5 per minute.
        assert_eq!(denied.reset_seconds, 12);
    }

    #[test]
    fn test_first_request_always_succeeds() {
        let (limiter, _) = limiter_with(plain_settings());
        let d = limiter.check_rate_limit("fresh", RateLimitPolicy::new(1_000, 1));
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[test]
    fn test_refill_over_time() {
        let (limiter, clock) = limiter_with(plain_settings());
        let policy = RateLimitPolicy::new(10_000, 10);
        for _ in 0..10 {
            assert!(limiter.check_rate_limit("k", policy).allowed);
        }
        assert!(!limiter.check_rate_limit("k", policy).allowed);

        clock.advance(Duration::from_millis(1_000));
        assert!(limiter.check_rate_limit("k", policy).allowed);
        assert!(!limiter.check_rate_limit("k", policy).allowed);

        clock.advance(Duration::from_secs(60));
        let d = limiter.check_rate_limit("k", policy);
        assert_eq!(d.remaining, 9);
    }

    #[test]
    fn test_refill_is_monotone_in_elapsed_time() {
        let (a, clock_a) = limiter_with(plain_settings());
        let (b, clock_b) = limiter_with(plain_settings());
        let policy = RateLimitPolicy::new(10_000, 10);
        for _ in 0..10 {
            a.check_rate_limit("k", policy);
            b.check_rate_limit("k", policy);
        }
        clock_a.advance(Duration::from_millis(2_500));
        clock_b.advance(Duration::from_millis(5_000));
        a.check_rate_limit("k", policy);
        b.check_rate_limit("k", policy);
        assert!(b.bucket("k").unwrap().tokens() >= a.bucket("k").unwrap().tokens());
    }

    #[test]
    fn test_malformed_policy_uses_default() {
        assert_eq!(RateLimitPolicy::new(0, 5).sanitized(), RateLimitPolicy::DEFAULT);
        assert_eq!(RateLimitPolicy::new(5, 0).sanitized(), RateLimitPolicy::DEFAULT);
        let (limiter, _) = limiter_with(plain_settings());
        let d = limiter.check_rate_limit("k", RateLimitPolicy::new(0, 0));
        assert_eq!(d.remaining, 99);
    }

    #[test]
    fn test_blocked_ip_denied_regardless_of_tokens() {
        let (limiter, clock) = limiter_with(plain_settings());
        limiter.block_ip("9.9.9.9", "manual", BlockDuration::For(Duration::from_secs(60)));
        let ctx = RequestContext {
            ip: "9.9.9.9",
            user_agent: None,
        };
        assert_eq!(
            limiter.check_request(&ctx),
            AdmissionDecision::Denied {
                reason: DenialReason::Blocked,
                retry_after_secs: Some(60),
            }
        );
        // The bucket was never touched.
        assert!(limiter.bucket("9.9.9.9").is_none());

        clock.advance(Duration::from_secs(61));
        assert!(limiter.check_request(&ctx).is_allowed());
    }

    #[test]
    fn test_permanent_block_has_no_retry_after() {
        let (limiter, _) = limiter_with(plain_settings());
        limiter.block_ip("1.1.1.1", "manual", BlockDuration::Permanent);
        let decision = limiter.check_request(&RequestContext {
            ip: "1.1.1.1",
            user_agent: None,
        });
        assert_eq!(
            decision,
            AdmissionDecision::Denied {
                reason: DenialReason::Blocked,
                retry_after_secs: None,
            }
        );
        assert!(limiter.unblock_ip("1.1.1.1"));
        assert!(limiter.get_blocked_ips().is_empty());
    }

    #[test]
    fn test_rapid_requests_pattern() {
        let (limiter, clock) = limiter_with(plain_settings());
        let policy = RateLimitPolicy::new(60_000, 2);
        limiter.check_rate_limit("k", policy);
        limiter.check_rate_limit("k", policy);
        let a = limiter.detect_suspicious_patterns("k");
        assert_eq!(a.patterns, vec![ThreatPattern::RapidRequests]);
        assert_eq!(a.risk_score, 25);

        clock.advance(Duration::from_secs(2));
        assert!(limiter.detect_suspicious_patterns("k").patterns.is_empty());
    }

    #[test]
    fn test_adaptive_policy_tightens_with_threat() {
        let (limiter, _) = limiter_with(plain_settings());
        assert_eq!(
            limiter.get_adaptive_rate_limit("k", 0.0),
            RateLimitPolicy::DEFAULT
        );
        assert_eq!(
            limiter.get_adaptive_rate_limit("k", 0.5),
            RateLimitPolicy::new(600_000, 30)
        );
        for _ in 0..3 {
            limiter.report_two_factor_failure("k");
        }
        // 0.5 + 30/100 * 0.5 = 0.65
        assert_eq!(
            limiter.get_adaptive_rate_limit("k", 0.5),
            RateLimitPolicy::new(600_000, 30)
        );
        // 0.6 + 0.15 = 0.75
        assert_eq!(
            limiter.get_adaptive_rate_limit("k", 0.6),
            RateLimitPolicy::new(300_000, 10)
        );
    }

    #[test]
    fn test_auto_block_on_high_score() {
        let settings = RateLimitSettings {
            adaptive: false,
            auto_block_score: 50,
            auto_block_secs: 600,
            ..RateLimitSettings::default()
        };
        let (limiter, _) = limiter_with(settings);
        for _ in 0..3 {
            limiter.report_two_factor_failure("6.6.6.6");
        }
        for ua in ["a", "b"] {
            limiter.observe_user_agent("6.6.6.6", ua);
        }
        // Third distinct agent pushes the score to 30 + 20.
        let decision = limiter.check_request(&RequestContext {
            ip: "6.6.6.6",
            user_agent: Some("c"),
        });
        assert_eq!(
            decision,
            AdmissionDecision::Denied {
                reason: DenialReason::Blocked,
                retry_after_secs: Some(600),
            }
        );
        assert!(limiter.is_ip_blocked("6.6.6.6"));
        let blocked = limiter.get_blocked_ips();
        assert!(blocked[0].reason.starts_with("automatic:"));
    }

    #[test]
    fn test_disabled_limiter_admits_everything() {
        let settings = RateLimitSettings {
            enabled: false,
            max_requests: 1,
            ..RateLimitSettings::default()
        };
        let (limiter, _) = limiter_with(settings);
        let ctx = RequestContext {
            ip: "2.2.2.2",
            user_agent: None,
        };
        for _ in 0..10 {
            assert!(limiter.check_request(&ctx).is_allowed());
        }
    }

    #[test]
    fn test_apply_settings_changes_default_policy() {
        let (limiter, _) = limiter_with(plain_settings());
        limiter.apply_settings(RateLimitSettings {
            window_ms: 1_000,
            max_requests: 2,
            ..plain_settings()
        });
        assert_eq!(limiter.default_policy(), RateLimitPolicy::new(1_000, 2));
        let ctx = RequestContext {
            ip: "3.3.3.3",
            user_agent: None,
        };
        assert!(limiter.check_request(&ctx).is_allowed());
        assert!(limiter.check_request(&ctx).is_allowed());
        assert_eq!(
            limiter.check_request(&ctx),
            AdmissionDecision::Denied {
                reason: DenialReason::RateLimited,
                retry_after_secs: Some(1),
            }
        );
    }

    #[test]
    fn test_reset_rate_limit_restores_full_bucket() {
        let (limiter, _) = limiter_with(plain_settings());
        let policy = RateLimitPolicy::new(60_000, 1);
        limiter.check_rate_limit("k", policy);
        assert!(!limiter.check_rate_limit("k", policy).allowed);
        limiter.reset_rate_limit("k");
        assert!(limiter.check_rate_limit("k", policy).allowed);
    }

    #[test]
    fn test_cleanup_evicts_idle_and_expired() {
        let (limiter, clock) = limiter_with(plain_settings());
        limiter.check_rate_limit("idle", RateLimitPolicy::DEFAULT);
        limiter.block_ip("4.4.4.4", "x", BlockDuration::For(Duration::from_secs(10)));
        limiter.observe_user_agent("idle", "ua");

        clock.advance(Duration::from_secs(2 * 3600));
        limiter.check_rate_limit("active", RateLimitPolicy::DEFAULT);

        let summary = limiter.cleanup();
        assert_eq!(
            summary,
            CleanupSummary {
                expired_blocks: 1,
                idle_buckets: 1,
                stale_signals: 1,
            }
        );
        assert!(limiter.bucket("active").is_some());
        assert!(limiter.bucket("idle").is_none());
    }

    #[test]
    fn test_cleanup_with_unbounded_idle_ttl_keeps_buckets() {
        let (limiter, clock) = limiter_with(RateLimitSettings {
            idle_bucket_ttl_secs: u64::MAX,
            ..plain_settings()
        });
        limiter.check_rate_limit("quiet", RateLimitPolicy::DEFAULT);
        clock.advance(Duration::from_secs(30 * 86_400));

        let summary = limiter.cleanup();
        assert_eq!(summary.idle_buckets, 0);
        assert!(limiter.bucket("quiet").is_some());
    }

    #[test]
    fn test_stats_window() {
        let (limiter, clock) = limiter_with(RateLimitSettings {
            max_requests: 1,
            ..plain_settings()
        });
        let ctx = RequestContext {
            ip: "5.5.5.5",
            user_agent: None,
        };
        limiter.check_request(&ctx);
        limiter.check_request(&ctx);
        limiter.block_ip("5.5.5.5", "x", BlockDuration::Permanent);
        limiter.check_request(&ctx);

        let stats = limiter.stats();
        assert_eq!((stats.allowed, stats.limited, stats.blocked), (1, 1, 1));

        clock.advance(Duration::from_secs(60));
        let closed = limiter.reset_stats_window();
        assert_eq!(closed.allowed, 1);
        let fresh = limiter.stats();
        assert_eq!((fresh.allowed, fresh.limited, fresh.blocked), (0, 0, 0));
        assert_eq!(fresh.window_started_ms, 1_060_000);
    }

    #[test]
    fn test_concurrent_requests_never_overspend() {
        let (limiter, _) = limiter_with(plain_settings());
        let limiter = Arc::new(limiter);
        let policy = RateLimitPolicy::new(3_600_000, 50);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.check_rate_limit("shared", policy).allowed)
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_within_capacity(
            max_requests in 1u32..200,
            window_ms in 1u64..600_000,
            steps in proptest::collection::vec(0u64..120_000, 1..60),
        ) {
            let (limiter, clock) = limiter_with(plain_settings());
            let policy = RateLimitPolicy::new(window_ms, max_requests);
            for step in steps {
                clock.advance(Duration::from_millis(step));
                limiter.check_rate_limit("k", policy);
                let tokens = limiter.bucket("k").unwrap().tokens();
                prop_assert!(tokens >= 0.0);
                prop_assert!(tokens <= policy.capacity());
            }
        }
    }
}
