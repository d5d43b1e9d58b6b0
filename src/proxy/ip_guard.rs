use dashmap::DashMap;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::models::GuardConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    InvalidApiKey,
    UnknownPath,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::InvalidApiKey => "invalid_api_key",
            ViolationKind::UnknownPath => "unknown_path",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Permanent,
    Temporary,
}

#[derive(Debug, Clone)]
pub struct BlockStatus {
    pub blocked: bool,
    pub reason: Option<BlockReason>,
    pub expires_at_ms: Option<i64>,
}

impl BlockStatus {
    fn clean() -> Self {
        Self {
            blocked: false,
            reason: None,
            expires_at_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct IpRecord {
    violation_count: u32,
    first_violation_ms: i64,
    temp_blocked_until_ms: Option<i64>,
    temp_block_cycles: u32,
    cycle_anchor_ms: i64,
    permanent: bool,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Matches an exact IP or an IPv4 CIDR prefix.
fn whitelist_matches(entry: &str, ip: &str) -> bool {
    if entry == ip {
        return true;
    }
    let Some((prefix, bits)) = entry.split_once('/') else {
        return false;
    };
    let (Ok(net), Ok(addr), Ok(bits)) = (
        prefix.parse::<Ipv4Addr>(),
        ip.parse::<IpAddr>(),
        bits.parse::<u32>(),
    ) else {
        return false;
    };
    let IpAddr::V4(addr) = addr else {
        return false;
    };
    if bits > 32 {
        return false;
    }
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    (u32::from(net) & mask) == (u32::from(addr) & mask)
}

/// Violation-driven per-IP blocking. Repeated auth failures or path probes
/// inside the counting window escalate: temporary block with doubling
/// duration, then permanent after enough cycles inside the cycle window.
pub struct IpGuard {
    records: DashMap<String, IpRecord>,
    config: GuardConfig,
    persist_path: Option<PathBuf>,
}

impl IpGuard {
    pub fn new(config: GuardConfig, persist_path: Option<PathBuf>) -> Self {
        let guard = Self {
            records: DashMap::new(),
            config,
            persist_path,
        };
        guard.load_from_disk();
        guard
    }

    fn load_from_disk(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let Ok(raw) = std::fs::read_to_string(path) else {
            return;
        };
        let Ok(doc) = serde_json::from_str::<serde_json::Value>(&raw) else {
            tracing::warn!("[W-IPGUARD-FILE] blocked-IP file unreadable, starting empty");
            return;
        };
        if let Some(ips) = doc.get("ips").and_then(|v| v.as_object()) {
            let now = now_ms();
            for (ip, rec) in ips {
                let permanent = rec.get("permanent").and_then(|v| v.as_bool()).unwrap_or(false);
                let expires = rec.get("expiresAt").and_then(|v| v.as_i64());
                let cycles = rec
                    .get("tempBlockCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                if !permanent && expires.map(|e| e <= now).unwrap_or(true) {
                    continue;
                }
                self.records.insert(
                    ip.clone(),
                    IpRecord {
                        violation_count: 0,
                        first_violation_ms: 0,
                        temp_blocked_until_ms: expires,
                        temp_block_cycles: cycles,
                        cycle_anchor_ms: now,
                        permanent,
                    },
                );
            }
        }
    }

    fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let mut ips = serde_json::Map::new();
        for item in self.records.iter() {
            let rec = item.value();
            if !rec.permanent && rec.temp_blocked_until_ms.is_none() {
                continue;
            }
            ips.insert(
                item.key().clone(),
                json!({
                    "permanent": rec.permanent,
                    "expiresAt": rec.temp_blocked_until_ms,
                    "tempBlockCount": rec.temp_block_cycles,
                }),
            );
        }
        let doc = json!({ "ips": ips, "whitelist": self.config.whitelist });
        let tmp = path.with_extension("tmp");
        if std::fs::write(&tmp, serde_json::to_string_pretty(&doc).unwrap_or_default()).is_ok() {
            if let Err(e) = std::fs::rename(&tmp, path) {
                tracing::warn!("[W-IPGUARD-PERSIST] rename failed: {}", e);
            }
        }
    }

    pub fn is_whitelisted(&self, ip: &str) -> bool {
        self.config
            .whitelist
            .iter()
            .any(|entry| whitelist_matches(entry, ip))
    }

    pub fn check(&self, ip: &str) -> BlockStatus {
        if self.is_whitelisted(ip) {
            return BlockStatus::clean();
        }
        let Some(mut rec) = self.records.get_mut(ip) else {
            return BlockStatus::clean();
        };
        if rec.permanent {
            return BlockStatus {
                blocked: true,
                reason: Some(BlockReason::Permanent),
                expires_at_ms: None,
            };
        }
        if let Some(until) = rec.temp_blocked_until_ms {
            let now = now_ms();
            if now < until {
                return BlockStatus {
                    blocked: true,
                    reason: Some(BlockReason::Temporary),
                    expires_at_ms: Some(until),
                };
            }
            // Expired block: back to accumulating, cycle recorded.
            rec.temp_blocked_until_ms = None;
            rec.violation_count = 0;
            rec.first_violation_ms = 0;
        }
        BlockStatus::clean()
    }

    pub fn record_violation(&self, ip: &str, kind: ViolationKind) {
        if self.is_whitelisted(ip) {
            return;
        }
        let now = now_ms();
        let window_ms = (self.config.window_secs * 1000) as i64;
        let cycle_window_ms = (self.config.cycle_window_secs * 1000) as i64;

        let mut rec = self.records.entry(ip.to_string()).or_default();
        if rec.permanent || rec.temp_blocked_until_ms.map(|u| now < u).unwrap_or(false) {
            return;
        }

        if rec.first_violation_ms == 0 || now - rec.first_violation_ms > window_ms {
            rec.violation_count = 1;
            rec.first_violation_ms = now;
        } else {
            rec.violation_count += 1;
        }
        tracing::debug!(
            "[IpGuard] violation {} from {} ({}/{})",
            kind.as_str(),
            ip,
            rec.violation_count,
            self.config.violation_threshold
        );

        if rec.violation_count < self.config.violation_threshold {
            return;
        }

        // Threshold crossed inside the window: open a block cycle.
        if rec.cycle_anchor_ms == 0 || now - rec.cycle_anchor_ms > cycle_window_ms {
            rec.temp_block_cycles = 0;
            rec.cycle_anchor_ms = now;
        }
        rec.temp_block_cycles += 1;
        rec.violation_count = 0;
        rec.first_violation_ms = 0;

        if rec.temp_block_cycles >= self.config.permanent_after_cycles {
            rec.permanent = true;
            rec.temp_blocked_until_ms = None;
            tracing::warn!(
                "[W-IPGUARD-PERMANENT] {} promoted to permanent block after {} cycles",
                ip,
                rec.temp_block_cycles
            );
        } else {
            let duration_ms = (self.config.temp_block_secs * 1000) as i64
                * (1i64 << (rec.temp_block_cycles - 1).min(16));
            rec.temp_blocked_until_ms = Some(now + duration_ms);
            tracing::warn!(
                "[W-IPGUARD-TEMPBLOCK] {} blocked for {}s (cycle {})",
                ip,
                duration_ms / 1000,
                rec.temp_block_cycles
            );
        }
        drop(rec);
        self.persist();
    }

    /// Administrative unblock: back to clean, cycles and permanence cleared.
    pub fn unblock(&self, ip: &str) {
        self.records.remove(ip);
        self.persist();
        tracing::info!("[IpGuard] {} unblocked by operator", ip);
    }

    /// Purges expired temp blocks and stale accumulating records. Runs from
    /// the background sweeper.
    pub fn sweep(&self) {
        let now = now_ms();
        let window_ms = (self.config.window_secs * 1000) as i64;
        let mut changed = false;
        self.records.retain(|_, rec| {
            if rec.permanent {
                return true;
            }
            if let Some(until) = rec.temp_blocked_until_ms {
                if now >= until {
                    rec.temp_blocked_until_ms = None;
                    rec.violation_count = 0;
                    rec.first_violation_ms = 0;
                    changed = true;
                }
                return true;
            }
            // Accumulating records outside both windows carry no state worth
            // keeping unless a cycle count is still live.
            let stale_window =
                rec.first_violation_ms == 0 || now - rec.first_violation_ms > window_ms;
            let stale_cycles = rec.temp_block_cycles == 0
                || now - rec.cycle_anchor_ms > (self.config.cycle_window_secs * 1000) as i64;
            !(stale_window && stale_cycles)
        });
        if changed {
            self.persist();
        }
    }

    #[cfg(test)]
    fn cycles(&self, ip: &str) -> u32 {
        self.records.get(ip).map(|r| r.temp_block_cycles).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> GuardConfig {
        GuardConfig {
            window_secs: 60,
            violation_threshold: 10,
            temp_block_secs: 1800,
            cycle_window_secs: 86_400,
            permanent_after_cycles: 5,
            whitelist: vec!["10.0.0.1".to_string(), "192.168.0.0/16".to_string()],
        }
    }

    fn burst(guard: &IpGuard, ip: &str, n: u32) {
        for _ in 0..n {
            guard.record_violation(ip, ViolationKind::InvalidApiKey);
        }
    }

    #[test]
    fn threshold_inside_window_temp_blocks() {
        let guard = IpGuard::new(test_config(), None);
        burst(&guard, "203.0.113.7", 9);
        assert!(!guard.check("203.0.113.7").blocked);
        burst(&guard, "203.0.113.7", 1);
        let status = guard.check("203.0.113.7");
        assert!(status.blocked);
        assert_eq!(status.reason, Some(BlockReason::Temporary));
        let expires = status.expires_at_ms.unwrap();
        let delta = expires - chrono::Utc::now().timestamp_millis();
        // ~30 minutes ahead.
        assert!(delta > 29 * 60 * 1000 && delta <= 30 * 60 * 1000 + 1000);
    }

    #[test]
    fn block_duration_doubles_per_cycle() {
        let guard = IpGuard::new(test_config(), None);
        let ip = "203.0.113.8";
        burst(&guard, ip, 10);
        // Simulate expiry of the first block.
        guard
            .records
            .get_mut(ip)
            .unwrap()
            .temp_blocked_until_ms = Some(now_ms() - 1);
        assert!(!guard.check(ip).blocked);
        burst(&guard, ip, 10);
        assert_eq!(guard.cycles(ip), 2);
        let status = guard.check(ip);
        let delta = status.expires_at_ms.unwrap() - now_ms();
        // Second cycle: ~60 minutes.
        assert!(delta > 59 * 60 * 1000, "got {}ms", delta);
    }

    #[test]
    fn five_cycles_promote_to_permanent() {
        let guard = IpGuard::new(test_config(), None);
        let ip = "203.0.113.9";
        for _ in 0..5 {
            burst(&guard, ip, 10);
            if let Some(mut rec) = guard.records.get_mut(ip) {
                if rec.temp_blocked_until_ms.is_some() {
                    rec.temp_blocked_until_ms = Some(now_ms() - 1);
                }
            }
            let _ = guard.check(ip);
        }
        let status = guard.check(ip);
        assert!(status.blocked);
        assert_eq!(status.reason, Some(BlockReason::Permanent));
        assert!(status.expires_at_ms.is_none());
    }

    #[test]
    fn whitelisted_ips_never_accumulate() {
        let guard = IpGuard::new(test_config(), None);
        burst(&guard, "10.0.0.1", 50);
        assert!(!guard.check("10.0.0.1").blocked);
        burst(&guard, "192.168.44.9", 50);
        assert!(!guard.check("192.168.44.9").blocked);
    }

    #[test]
    fn unblock_returns_ip_to_clean() {
        let guard = IpGuard::new(test_config(), None);
        let ip = "203.0.113.10";
        burst(&guard, ip, 10);
        assert!(guard.check(ip).blocked);
        guard.unblock(ip);
        assert!(!guard.check(ip).blocked);
        assert_eq!(guard.cycles(ip), 0);
    }

    #[test]
    fn violations_outside_window_reset_count() {
        let guard = IpGuard::new(test_config(), None);
        let ip = "203.0.113.11";
        burst(&guard, ip, 9);
        // Age the window out.
        guard.records.get_mut(ip).unwrap().first_violation_ms =
            now_ms() - 61 * 1000;
        burst(&guard, ip, 1);
        assert!(!guard.check(ip).blocked);
    }

    #[test]
    fn persistence_roundtrip_keeps_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocked_ips.json");
        let ip = "203.0.113.12";
        {
            let guard = IpGuard::new(test_config(), Some(path.clone()));
            burst(&guard, ip, 10);
            assert!(guard.check(ip).blocked);
        }
        let reloaded = IpGuard::new(test_config(), Some(path));
        assert!(reloaded.check(ip).blocked);
    }

    #[test]
    fn cidr_matching_handles_edges() {
        assert!(whitelist_matches("192.168.0.0/16", "192.168.255.1"));
        assert!(!whitelist_matches("192.168.0.0/16", "192.169.0.1"));
        assert!(whitelist_matches("0.0.0.0/0", "8.8.8.8"));
        assert!(!whitelist_matches("192.168.0.0/40", "192.168.0.1"));
        assert!(whitelist_matches("::1", "::1"));
    }
}
