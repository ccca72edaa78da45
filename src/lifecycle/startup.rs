//! Startup orchestration.
//!
//! # Responsibilities
//! - Resolve secrets from the environment
//! - Build every service on one shared clock
//! - Start the periodic maintenance tasks
//! - Tie admission, two-factor and blocking outcomes to the audit ledger
//!
//! # Design Decisions
//! - Fail fast: a missing secret or unusable audit directory is fatal
//! - Only rate-limit settings change at runtime
//! - An IP turning suspicious is recorded once per episode, and rate-limit
//!   denials at most once per [`RATE_LIMIT_AUDIT_INTERVAL_MS`]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::audit::{Actor, AuditContext, AuditEventType, AuditLedger, AuditStatus, Severity};
use crate::clock::{Clock, SystemClock};
use crate::config::{secrets, ConfigError, GuardConfig};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::tasks::BackgroundTasks;
use crate::security::{
    Admission, AdmissionDecision, BlockDuration, DenialReason, RateLimiter, RequestContext,
};
use crate::totp::{TotpAuthenticator, TwoFactorOutcome, VerificationMethod};
use crate::vault::CryptoVault;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Audit directory {path} is unusable: {source}")]
    AuditDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Minimum gap between two `RateLimitExceeded` records for one IP.
pub const RATE_LIMIT_AUDIT_INTERVAL_MS: u64 = 60_000;

/// What has already been written to the ledger for an IP.
#[derive(Debug, Default, Clone, Copy)]
struct AuditMarks {
    suspicious: bool,
    last_limited_ms: Option<u64>,
}

/// Every security service, built from one configuration.
#[derive(Debug, Clone)]
pub struct SecurityCore {
    pub vault: Arc<CryptoVault>,
    pub limiter: Arc<RateLimiter>,
    pub authenticator: Arc<TotpAuthenticator>,
    pub ledger: Arc<AuditLedger>,
    config: Arc<GuardConfig>,
    clock: Arc<dyn Clock>,
    audit_marks: Arc<DashMap<String, AuditMarks>>,
}

impl SecurityCore {
    /// Resolve secrets from the environment and build on the system clock.
    pub fn from_config(config: &GuardConfig) -> Result<Self, StartupError> {
        let audit_key = secrets::audit_signing_key(config)?;
        let master_key = secrets::vault_master_key(config)?;
        Self::build(config, audit_key, master_key, Arc::new(SystemClock))
    }

    /// Build with explicit secrets and clock.
    pub fn build(
        config: &GuardConfig,
        audit_signing_key: Vec<u8>,
        master_key: Option<[u8; 32]>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StartupError> {
        let log_dir = &config.audit.log_dir;
        fs::create_dir_all(log_dir).map_err(|source| StartupError::AuditDir {
            path: log_dir.clone(),
            source,
        })?;

        let vault = Arc::new(CryptoVault::from_settings(&config.vault, master_key));
        let limiter = Arc::new(RateLimiter::with_clock(config.rate_limit.clone(), clock.clone()));
        let authenticator = Arc::new(TotpAuthenticator::with_clock(config.totp.clone(), clock.clone()));
        let ledger = Arc::new(
            AuditLedger::new(&config.audit, audit_signing_key, vault.clone())
                .with_clock(clock.clone()),
        );

        tracing::info!(
            environment = ?config.environment,
            audit_dir = %log_dir.display(),
            rate_limiting = config.rate_limit.enabled,
            adaptive = config.rate_limit.adaptive,
            master_key = vault.has_master_key(),
            "Security core initialized"
        );

        Ok(Self {
            vault,
            limiter,
            authenticator,
            ledger,
            config: Arc::new(config.clone()),
            clock,
            audit_marks: Arc::new(DashMap::new()),
        })
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Spawn limiter cleanup, stats rollover, rotation, integrity and retention jobs.
    pub fn start(&self) -> BackgroundTasks {
        let rate = &self.config.rate_limit;
        let audit = &self.config.audit;
        let mut tasks = BackgroundTasks::new(Shutdown::new());

        let core = self.clone();
        tasks.spawn_periodic("limiter-cleanup", Duration::from_secs(rate.cleanup_interval_secs), move || {
            let core = core.clone();
            async move {
                core.limiter.cleanup();
                core.prune_audit_marks();
            }
        });

        let limiter = self.limiter.clone();
        tasks.spawn_periodic("stats-window", Duration::from_secs(rate.stats_window_secs), move || {
            let limiter = limiter.clone();
            async move {
                let closed = limiter.reset_stats_window();
                tracing::info!(
                    allowed = closed.allowed,
                    limited = closed.limited,
                    blocked = closed.blocked,
                    "Admission stats window closed"
                );
            }
        });

        let ledger = self.ledger.clone();
        tasks.spawn_periodic("audit-rotation", Duration::from_secs(audit.rotation_check_secs), move || {
            let ledger = ledger.clone();
            async move {
                match tokio::task::spawn_blocking(move || ledger.rotate_if_needed()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "Audit rotation check failed"),
                    Err(e) => tracing::error!(error = %e, "Audit rotation task panicked"),
                }
            }
        });

        let ledger = self.ledger.clone();
        tasks.spawn_periodic("audit-integrity", Duration::from_secs(audit.integrity_interval_secs), move || {
            let ledger = ledger.clone();
            async move {
                let sweep = ledger.clone();
                match tokio::task::spawn_blocking(move || sweep.verify_integrity()).await {
                    Ok(report) if !report.valid => {
                        let mut details = Map::new();
                        details.insert("filesChecked".into(), json!(report.files_checked));
                        details.insert("eventsChecked".into(), json!(report.events_checked));
                        details.insert("issues".into(), json!(report.issues.len()));
                        ledger.record(
                            AuditEventType::SuspiciousActivity,
                            "audit integrity check failed",
                            details,
                            AuditContext::new("system")
                                .with_status(AuditStatus::Failure)
                                .with_severity(Severity::Critical),
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Integrity sweep panicked"),
                }
            }
        });

        let ledger = self.ledger.clone();
        let retention_days = audit.retention_days;
        tasks.spawn_periodic("audit-retention", Duration::from_secs(audit.retention_interval_secs), move || {
            let ledger = ledger.clone();
            async move {
                match tokio::task::spawn_blocking(move || ledger.cleanup(retention_days)).await {
                    Ok(Ok(removed)) if removed > 0 => {
                        tracing::info!(removed, retention_days, "Expired audit logs removed");
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "Audit retention cleanup failed"),
                    Err(e) => tracing::error!(error = %e, "Audit retention task panicked"),
                }
            }
        });

        tracing::info!(tasks = ?tasks.names(), "Background tasks started");
        tasks
    }

    /// Apply a reloaded configuration. Sections other than rate limiting need a restart.
    pub fn apply_config(&self, new: &GuardConfig) {
        self.limiter.apply_settings(new.rate_limit.clone());

        let current = &self.config;
        let mut ignored = Vec::new();
        if new.totp != current.totp {
            ignored.push("totp");
        }
        if new.vault != current.vault {
            ignored.push("vault");
        }
        if new.audit != current.audit {
            ignored.push("audit");
        }
        if new.observability != current.observability {
            ignored.push("observability");
        }
        if !ignored.is_empty() {
            tracing::warn!(sections = ?ignored, "Changed settings take effect after restart");
        }
        tracing::info!("Rate limit settings reloaded");
    }

    /// Admission check that audits automatic blocks, IPs turning suspicious
    /// and rate-limit denials.
    pub fn admit(&self, request: &RequestContext<'_>) -> AdmissionDecision {
        let was_blocked = self.limiter.is_ip_blocked(request.ip);
        let decision = self.limiter.check_request(request);
        if was_blocked {
            return decision;
        }

        match &decision {
            AdmissionDecision::Denied {
                reason: DenialReason::Blocked,
                retry_after_secs,
            } => {
                self.audit_marks.remove(request.ip);
                self.audit_automatic_block(request, *retry_after_secs);
            }
            AdmissionDecision::Denied {
                reason: DenialReason::RateLimited,
                retry_after_secs,
            } => {
                self.audit_suspicion(request);
                self.audit_rate_limited(request, *retry_after_secs);
            }
            AdmissionDecision::Allowed { .. } => self.audit_suspicion(request),
        }
        decision
    }

    fn audit_automatic_block(&self, request: &RequestContext<'_>, retry_after_secs: Option<u64>) {
        let reason = self
            .limiter
            .get_blocked_ips()
            .into_iter()
            .find(|b| b.ip == request.ip)
            .map(|b| b.reason)
            .unwrap_or_default();
        let mut details = Map::new();
        details.insert("ip".into(), json!(request.ip));
        details.insert("reason".into(), json!(reason));
        details.insert("durationSecs".into(), json!(retry_after_secs));
        self.ledger.record(
            AuditEventType::IpBlocked,
            "automatic block",
            details,
            request_context(request, None),
        );
    }

    /// Record the transition into a suspicious assessment.
    fn audit_suspicion(&self, request: &RequestContext<'_>) {
        let assessment = self.limiter.detect_suspicious_patterns(request.ip);
        if !assessment.suspicious {
            if let Some(mut marks) = self.audit_marks.get_mut(request.ip) {
                marks.suspicious = false;
            }
            return;
        }

        let already_recorded = {
            let mut marks = self.audit_marks.entry(request.ip.to_string()).or_default();
            std::mem::replace(&mut marks.suspicious, true)
        };
        if already_recorded {
            return;
        }

        let patterns: Vec<&str> = assessment.patterns.iter().map(|p| p.as_str()).collect();
        tracing::warn!(
            client = %request.ip,
            risk_score = assessment.risk_score,
            patterns = ?patterns,
            "Suspicious activity detected"
        );
        let mut details = Map::new();
        details.insert("ip".into(), json!(request.ip));
        details.insert("riskScore".into(), json!(assessment.risk_score));
        details.insert("patterns".into(), json!(patterns));
        self.ledger.record(
            AuditEventType::SuspiciousActivity,
            "suspicious request pattern",
            details,
            request_context(request, None),
        );
    }

    fn audit_rate_limited(&self, request: &RequestContext<'_>, retry_after_secs: Option<u64>) {
        let now = self.clock.now_ms();
        let due = {
            let mut marks = self.audit_marks.entry(request.ip.to_string()).or_default();
            let due = marks
                .last_limited_ms
                .map_or(true, |last| now.saturating_sub(last) >= RATE_LIMIT_AUDIT_INTERVAL_MS);
            if due {
                marks.last_limited_ms = Some(now);
            }
            due
        };
        if !due {
            return;
        }

        let mut details = Map::new();
        details.insert("ip".into(), json!(request.ip));
        details.insert("retryAfterSecs".into(), json!(retry_after_secs));
        self.ledger.record(
            AuditEventType::RateLimitExceeded,
            "rate limit exceeded",
            details,
            request_context(request, None).with_status(AuditStatus::Failure),
        );
    }

    /// Forget marks for IPs that are neither suspicious nor recently limited.
    pub fn prune_audit_marks(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.audit_marks.len();
        self.audit_marks.retain(|ip, marks| {
            let limited_recently = marks
                .last_limited_ms
                .is_some_and(|last| now.saturating_sub(last) < RATE_LIMIT_AUDIT_INTERVAL_MS);
            limited_recently
                || (marks.suspicious && self.limiter.detect_suspicious_patterns(ip).suspicious)
        });
        before.saturating_sub(self.audit_marks.len())
    }

    /// Verify a second factor and record the outcome.
    ///
    /// Failures feed the limiter's threat signals for the request IP.
    pub fn verify_two_factor(
        &self,
        actor: &Actor,
        token: &str,
        request: &RequestContext<'_>,
    ) -> TwoFactorOutcome {
        let outcome = self.authenticator.verify_attempt(&actor.id, token);
        let mut details = Map::new();

        let event_type = if outcome.success {
            self.limiter.clear_two_factor_failures(request.ip);
            match outcome.method {
                Some(VerificationMethod::BackupCode) => {
                    details.insert("remainingBackupCodes".into(), json!(outcome.remaining_backup_codes));
                    AuditEventType::BackupCodeUsed
                }
                _ => AuditEventType::TwoFactorVerified,
            }
        } else {
            self.limiter.report_two_factor_failure(request.ip);
            AuditEventType::TwoFactorFailed
        };
        if let Some(method) = outcome.method {
            details.insert("method".into(), Value::from(method.as_str()));
        }

        let status = if outcome.success {
            AuditStatus::Success
        } else {
            AuditStatus::Failure
        };
        self.ledger.record(
            event_type,
            outcome.message,
            details,
            request_context(request, Some(actor)).with_status(status),
        );
        outcome
    }

    /// Manually block an IP and record who did it.
    pub fn block_ip(&self, ip: &str, reason: &str, duration: BlockDuration, context: AuditContext) {
        self.limiter.block_ip(ip, reason, duration);

        let mut details = Map::new();
        details.insert("ip".into(), json!(ip));
        details.insert("reason".into(), json!(reason));
        match duration {
            BlockDuration::For(d) => details.insert("durationSecs".into(), json!(d.as_secs())),
            BlockDuration::Permanent => details.insert("permanent".into(), json!(true)),
        };
        self.ledger
            .record(AuditEventType::IpBlocked, "manual block", details, context);
    }

    /// Lift a block. Records an event only when one was active.
    pub fn unblock_ip(&self, ip: &str, context: AuditContext) -> bool {
        let removed = self.limiter.unblock_ip(ip);
        if removed {
            let mut details = Map::new();
            details.insert("ip".into(), json!(ip));
            self.ledger
                .record(AuditEventType::IpUnblocked, "manual unblock", details, context);
        }
        removed
    }
}

impl Admission for SecurityCore {
    fn admit(&self, request: &RequestContext<'_>) -> AdmissionDecision {
        SecurityCore::admit(self, request)
    }
}

fn request_context(request: &RequestContext<'_>, actor: Option<&Actor>) -> AuditContext {
    let mut context = AuditContext::new(request.ip);
    if let Some(actor) = actor {
        context = context.with_actor(actor.clone());
    }
    if let Some(user_agent) = request.user_agent {
        context = context.with_user_agent(user_agent);
    }
    context
}
