//! Attempt Store: per-host failure counters persisted across restarts,
//! with threshold evaluation to decide which hosts should be denied.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SentrydError;
use crate::host::Host;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuspiciousEntry {
    pub user: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub host: Host,
    pub failures_invalid_user: u32,
    pub failures_valid_user: u32,
    pub failures_root: u32,
    pub failures_restricted: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub suspicious_users: Vec<SuspiciousEntry>,
}

impl LoginAttempt {
    fn new(host: Host, now: DateTime<Utc>) -> Self {
        Self {
            host,
            failures_invalid_user: 0,
            failures_valid_user: 0,
            failures_root: 0,
            failures_restricted: 0,
            first_seen: now,
            last_seen: now,
            suspicious_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Thresholds {
    pub invalid: Option<u32>,
    pub valid: Option<u32>,
    pub root: Option<u32>,
    pub restricted: Option<u32>,
    pub restricted_users: HashSet<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    attempts: HashMap<Host, LoginAttempt>,
}

pub struct AttemptStore {
    path: PathBuf,
    attempts: HashMap<Host, LoginAttempt>,
    /// Hosts already returned by `deny_candidates` this process lifetime.
    emitted: HashSet<Host>,
    thresholds: Thresholds,
}

impl AttemptStore {
    pub fn load(work_dir: &Path, thresholds: Thresholds) -> Result<Self, SentrydError> {
        let path = work_dir.join("attempts.json");
        let attempts = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| SentrydError::io(path.display().to_string(), e))?;
            let state: PersistedState =
                serde_json::from_str(&raw).map_err(|e| SentrydError::Parse(e.to_string()))?;
            state.attempts
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            attempts,
            emitted: HashSet::new(),
            thresholds,
        })
    }

    /// Record one classified line against `host`. `success == false`
    /// means a failed authentication attempt.
    pub fn record(&mut self, host: Host, user: Option<&str>, success: bool, invalid: bool, now: DateTime<Utc>) {
        let entry = self
            .attempts
            .entry(host)
            .or_insert_with(|| LoginAttempt::new(host, now));
        entry.last_seen = now;

        if success {
            // A success clears neither counter, but is reported as
            // suspicious if prior failures existed.
            let had_prior_failures = entry.failures_invalid_user > 0
                || entry.failures_valid_user > 0
                || entry.failures_root > 0
                || entry.failures_restricted > 0;
            if had_prior_failures {
                if let Some(u) = user {
                    entry.suspicious_users.push(SuspiciousEntry {
                        user: u.to_string(),
                        timestamp: now,
                    });
                }
            }
            return;
        }

        if invalid {
            entry.failures_invalid_user += 1;
        } else {
            entry.failures_valid_user += 1;
        }

        if let Some(u) = user {
            if u == "root" {
                entry.failures_root += 1;
            }
            if self.thresholds.restricted_users.contains(u) {
                entry.failures_restricted += 1;
            }
        }
    }

    /// Hosts whose counters crossed any applicable threshold since the
    /// last call, excluding hosts already emitted this process lifetime.
    pub fn deny_candidates(&mut self) -> HashSet<Host> {
        let mut out = HashSet::new();
        for (host, attempt) in &self.attempts {
            if self.emitted.contains(host) {
                continue;
            }
            if Self::crosses(&self.thresholds, attempt) {
                out.insert(*host);
            }
        }
        for host in &out {
            self.emitted.insert(*host);
        }
        out
    }

    fn crosses(thresholds: &Thresholds, attempt: &LoginAttempt) -> bool {
        if let Some(t) = thresholds.invalid {
            if attempt.failures_invalid_user >= t {
                return true;
            }
        }
        if let Some(t) = thresholds.valid {
            if attempt.failures_valid_user >= t {
                return true;
            }
        }
        if let Some(t) = thresholds.root {
            if attempt.failures_root >= t {
                return true;
            }
        }
        if let Some(t) = thresholds.restricted {
            if attempt.failures_restricted >= t {
                return true;
            }
        }
        false
    }

    /// Hosts with at least one suspicious-login entry, mapped to their
    /// users.
    pub fn suspicious(&self) -> HashMap<Host, Vec<SuspiciousEntry>> {
        self.attempts
            .iter()
            .filter(|(_, a)| !a.suspicious_users.is_empty())
            .map(|(h, a)| (*h, a.suspicious_users.clone()))
            .collect()
    }

    pub fn flush(&self) -> Result<(), SentrydError> {
        let state = PersistedState {
            attempts: self.attempts.clone(),
        };
        let raw = serde_json::to_string_pretty(&state)
            .map_err(|e| SentrydError::Parse(e.to_string()))?;
        std::fs::write(&self.path, raw)
            .map_err(|e| SentrydError::io(self.path.display().to_string(), e))
    }

    /// Evict records whose `last_seen` is older than `max_age`.
    pub fn purge(&mut self, max_age: chrono::Duration, now: DateTime<Utc>) -> usize {
        let before = self.attempts.len();
        self.attempts.retain(|_, a| now - a.last_seen < max_age);
        before - self.attempts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn thresholds(invalid: Option<u32>, valid: Option<u32>, root: Option<u32>, restricted: Option<u32>) -> Thresholds {
        Thresholds {
            invalid,
            valid,
            root,
            restricted,
            restricted_users: HashSet::new(),
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn invalid_user_storm_crosses_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AttemptStore::load(dir.path(), thresholds(Some(3), None, None, None)).unwrap();
        let host: Host = "192.0.2.10".parse().unwrap();
        for i in 0..3 {
            store.record(host, Some("admin"), false, true, t(i));
        }
        let candidates = store.deny_candidates();
        assert!(candidates.contains(&host));
    }

    #[test]
    fn threshold_monotonicity_not_tripped_early() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AttemptStore::load(dir.path(), thresholds(Some(3), None, None, None)).unwrap();
        let host: Host = "192.0.2.10".parse().unwrap();
        store.record(host, Some("admin"), false, true, t(0));
        store.record(host, Some("admin"), false, true, t(1));
        assert!(store.deny_candidates().is_empty());
    }

    #[test]
    fn emitted_once_per_process_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AttemptStore::load(dir.path(), thresholds(Some(1), None, None, None)).unwrap();
        let host: Host = "192.0.2.10".parse().unwrap();
        store.record(host, Some("admin"), false, true, t(0));
        assert!(store.deny_candidates().contains(&host));
        store.record(host, Some("admin"), false, true, t(1));
        assert!(store.deny_candidates().is_empty());
    }

    #[test]
    fn root_threshold_independent_of_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AttemptStore::load(dir.path(), thresholds(Some(10), None, Some(1), None)).unwrap();
        let host: Host = "198.51.100.5".parse().unwrap();
        store.record(host, Some("root"), false, false, t(0));
        assert!(store.deny_candidates().contains(&host));
    }

    #[test]
    fn success_does_not_clear_counters() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AttemptStore::load(dir.path(), thresholds(Some(2), None, None, None)).unwrap();
        let host: Host = "192.0.2.10".parse().unwrap();
        store.record(host, Some("admin"), false, true, t(0));
        store.record(host, Some("admin"), true, false, t(1));
        store.record(host, Some("admin"), false, true, t(2));
        assert!(store.deny_candidates().contains(&host));
    }

    #[test]
    fn flush_then_reload_preserves_counters() {
        let dir = tempfile::tempdir().unwrap();
        let host: Host = "192.0.2.10".parse().unwrap();
        {
            let mut store = AttemptStore::load(dir.path(), thresholds(Some(5), None, None, None)).unwrap();
            store.record(host, Some("admin"), false, true, t(0));
            store.flush().unwrap();
        }
        let store2 = AttemptStore::load(dir.path(), thresholds(Some(5), None, None, None)).unwrap();
        assert_eq!(store2.attempts.get(&host).unwrap().failures_invalid_user, 1);
    }

    #[test]
    fn purge_evicts_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AttemptStore::load(dir.path(), thresholds(None, None, None, None)).unwrap();
        let host: Host = "192.0.2.10".parse().unwrap();
        store.record(host, Some("admin"), false, true, t(0));
        let evicted = store.purge(chrono::Duration::seconds(10), t(100));
        assert_eq!(evicted, 1);
        assert!(store.attempts.is_empty());
    }
}
