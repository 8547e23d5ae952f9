//! Allow-list: CIDR/glob/exact membership test over a file of address
//! patterns, loaded once per process. Tracks hosts that slipped into the
//! deny file despite being allow-listed ("warned"), persisted so the
//! warning isn't repeated indefinitely.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use ipnet::IpNet;

use crate::error::SentrydError;
use crate::host::Host;

enum Pattern {
    Exact(IpAddr),
    Cidr(IpNet),
    Glob(GlobMatcher),
}

impl Pattern {
    fn matches(&self, host: &Host) -> bool {
        match self {
            Pattern::Exact(ip) => *ip == host.as_ip(),
            Pattern::Cidr(net) => net.contains(&host.as_ip()),
            Pattern::Glob(g) => g.is_match(host.to_string()),
        }
    }
}

fn parse_pattern(raw: &str) -> Option<Pattern> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('#') {
        return None;
    }
    if let Ok(net) = raw.parse::<IpNet>() {
        return Some(Pattern::Cidr(net));
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(Pattern::Exact(ip));
    }
    if raw.contains('*') || raw.contains('?') {
        if let Ok(glob) = Glob::new(raw) {
            return Some(Pattern::Glob(glob.compile_matcher()));
        }
    }
    None
}

pub struct AllowList {
    patterns: Vec<Pattern>,
    warned_path: PathBuf,
    warned: HashSet<Host>,
}

impl AllowList {
    pub fn load(allowlist_path: Option<&Path>, work_dir: &Path) -> Result<Self, SentrydError> {
        let mut patterns = Vec::new();
        if let Some(path) = allowlist_path {
            if path.exists() {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| SentrydError::io(path.display().to_string(), e))?;
                for line in raw.lines() {
                    if let Some(p) = parse_pattern(line) {
                        patterns.push(p);
                    }
                }
            }
        }

        let warned_path = work_dir.join("allowed-warned.json");
        let warned = if warned_path.exists() {
            let raw = std::fs::read_to_string(&warned_path)
                .map_err(|e| SentrydError::io(warned_path.display().to_string(), e))?;
            serde_json::from_str::<Vec<Host>>(&raw)
                .map_err(|e| SentrydError::Parse(e.to_string()))?
                .into_iter()
                .collect()
        } else {
            HashSet::new()
        };

        Ok(Self {
            patterns,
            warned_path,
            warned,
        })
    }

    pub fn contains(&self, host: &Host) -> bool {
        self.patterns.iter().any(|p| p.matches(host))
    }

    /// Record that `host` was found both in the deny file and the
    /// allow-list. Returns true the first time this host is recorded,
    /// so callers know whether to surface a fresh warning.
    pub fn mark_warned(&mut self, host: Host) -> bool {
        self.warned.insert(host)
    }

    pub fn warned_hosts(&self) -> impl Iterator<Item = &Host> {
        self.warned.iter()
    }

    pub fn persist(&self) -> Result<(), SentrydError> {
        let list: Vec<&Host> = self.warned.iter().collect();
        let raw = serde_json::to_string_pretty(&list).map_err(|e| SentrydError::Parse(e.to_string()))?;
        std::fs::write(&self.warned_path, raw)
            .map_err(|e| SentrydError::io(self.warned_path.display().to_string(), e))
    }
}
