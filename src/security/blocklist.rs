//! IP blocklist with lazy expiry.

use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;

/// How long a block lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDuration {
    For(Duration),
    Permanent,
}

/// A live blocklist entry as reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedIp {
    pub ip: String,
    pub reason: String,
    pub permanent: bool,
    pub blocked_at_ms: u64,
    pub expires_at_ms: Option<u64>,
}

#[derive(Debug, Clone)]
struct BlockEntry {
    reason: String,
    permanent: bool,
    blocked_at_ms: u64,
    expires_at_ms: Option<u64>,
}

impl BlockEntry {
    /// An expired non-permanent entry counts as absent.
    fn is_active(&self, now_ms: u64) -> bool {
        self.permanent || self.expires_at_ms.map_or(true, |exp| exp > now_ms)
    }

    fn to_blocked(&self, ip: &str) -> BlockedIp {
        BlockedIp {
            ip: ip.to_string(),
            reason: self.reason.clone(),
            permanent: self.permanent,
            blocked_at_ms: self.blocked_at_ms,
            expires_at_ms: self.expires_at_ms,
        }
    }
}

/// Concurrent IP blocklist.
#[derive(Debug, Default)]
pub struct IpBlocklist {
    entries: DashMap<String, BlockEntry>,
}

impl IpBlocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `ip`, replacing any existing entry.
    pub fn block(&self, ip: &str, reason: &str, duration: BlockDuration, now_ms: u64) {
        let (permanent, expires_at_ms) = match duration {
            BlockDuration::Permanent => (true, None),
            BlockDuration::For(d) => {
                let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
                (false, Some(now_ms.saturating_add(ms)))
            }
        };
        self.entries.insert(
            ip.to_string(),
            BlockEntry {
                reason: reason.to_string(),
                permanent,
                blocked_at_ms: now_ms,
                expires_at_ms,
            },
        );
    }

    /// Remove a block. Returns whether a live block existed.
    pub fn unblock(&self, ip: &str, now_ms: u64) -> bool {
        self.entries
            .remove(ip)
            .is_some_and(|(_, entry)| entry.is_active(now_ms))
    }

    /// Check a block, evicting it if it has expired.
    pub fn is_blocked(&self, ip: &str, now_ms: u64) -> bool {
        let active = match self.entries.get(ip) {
            Some(entry) => entry.is_active(now_ms),
            None => return false,
        };
        if !active {
            self.entries.remove_if(ip, |_, entry| !entry.is_active(now_ms));
        }
        active
    }

    /// The live entry for `ip`, if any.
    pub fn get(&self, ip: &str, now_ms: u64) -> Option<BlockedIp> {
        self.entries
            .get(ip)
            .filter(|entry| entry.is_active(now_ms))
            .map(|entry| entry.to_blocked(ip))
    }

    /// All live entries, sorted by IP.
    pub fn list(&self, now_ms: u64) -> Vec<BlockedIp> {
        let mut blocked: Vec<BlockedIp> = self
            .entries
            .iter()
            .filter(|r| r.value().is_active(now_ms))
            .map(|r| r.value().to_blocked(r.key()))
            .collect();
        blocked.sort_by(|a, b| a.ip.cmp(&b.ip));
        blocked
    }

    /// Drop expired entries. Returns the number removed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_active(now_ms));
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
