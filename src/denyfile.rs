//! Deny File Writer: reconciler for the OS access-control file (e.g.
//! `/etc/hosts.deny`). `apply` appends; `rewrite` canonicalizes the
//! whole file from a host set, collapsing any stray duplicate or
//! hand-edited entries accumulated over time.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::host::Host;

pub struct DenyFileWriter {
    path: PathBuf,
    block_service: Option<String>,
    /// When set, each new entry is preceded by a timestamp comment.
    wrap_with_timestamp: bool,
}

/// Result of one `apply` call.
pub struct ApplyResult {
    pub added: Vec<Host>,
    pub ok: bool,
}

const DENY_DELIMITER: &str = "# DenyHost:";
const ENTRY_DELIMITER: &str = " :: ";
/// BSD-style suffix appended after a service-tagged host.
const BSD_STYLE: &str = " : deny";

impl DenyFileWriter {
    pub fn new(path: PathBuf, block_service: Option<String>, wrap_with_timestamp: bool) -> Self {
        Self {
            path,
            block_service,
            wrap_with_timestamp,
        }
    }

    /// Parse the existing deny file into the set of hosts it currently
    /// denies, stripping inline comments (everything from the first `#`
    /// onward) before looking for an address.
    pub fn parse_existing(&self) -> std::io::Result<HashSet<Host>> {
        let mut out = HashSet::new();
        if !self.path.exists() {
            return Ok(out);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        for line in raw.lines() {
            let stripped = line.split('#').next().unwrap_or("").trim();
            if stripped.is_empty() {
                continue;
            }
            // Line may be a bare host, or `<service>: <host> : deny`.
            let candidate = stripped
                .rsplit(':')
                .nth(1)
                .map(str::trim)
                .unwrap_or(stripped);
            if let Ok(host) = candidate.parse::<Host>() {
                out.insert(host);
                continue;
            }
            if let Ok(host) = stripped.parse::<Host>() {
                out.insert(host);
            }
        }
        Ok(out)
    }

    fn format_line(&self, host: &Host) -> String {
        let payload = match &self.block_service {
            Some(service) => format!("{service}: {host}{BSD_STYLE}"),
            None => host.to_string(),
        };
        if self.wrap_with_timestamp {
            let asctime = Utc::now().format("%a %b %e %T %Y");
            format!("{DENY_DELIMITER} {asctime}{ENTRY_DELIMITER}{payload}")
        } else {
            payload
        }
    }

    /// Append `new_hosts` to the deny file, returning the hosts actually
    /// written and whether the write succeeded. On open failure, falls
    /// back to stdout and reports `ok: false`.
    pub fn apply(&self, new_hosts: &HashSet<Host>) -> ApplyResult {
        if new_hosts.is_empty() {
            return ApplyResult {
                added: Vec::new(),
                ok: true,
            };
        }

        let added: Vec<Host> = new_hosts.iter().copied().collect();
        match std::fs::OpenOptions::new().append(true).create(true).open(&self.path) {
            Ok(mut f) => {
                let mut ok = true;
                for host in &added {
                    let line = self.format_line(host);
                    if writeln!(f, "{line}").is_err() {
                        ok = false;
                    }
                }
                ApplyResult { added, ok }
            }
            Err(e) => {
                log::error!("failed to open deny file {}: {e}, falling back to stdout", self.path.display());
                for host in &added {
                    println!("{}", self.format_line(host));
                }
                ApplyResult { added, ok: false }
            }
        }
    }

    /// Rewrite the deny file from scratch with one canonicalized line
    /// per host in `hosts`, discarding any stray comments, duplicates,
    /// or hand-edited formatting accumulated by direct edits. Order is
    /// by host value so repeated rewrites of the same set are byte-for-
    /// byte identical.
    pub fn rewrite(&self, hosts: &HashSet<Host>) -> std::io::Result<()> {
        let mut ordered: Vec<&Host> = hosts.iter().collect();
        ordered.sort();
        let mut out = String::new();
        for host in ordered {
            out.push_str(&self.format_line(host));
            out.push('\n');
        }
        std::fs::write(&self.path, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_new_hosts_and_strips_comments_on_reparse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.deny");
        let writer = DenyFileWriter::new(path.clone(), None, false);
        let mut set = HashSet::new();
        set.insert("192.0.2.10".parse::<Host>().unwrap());
        let result = writer.apply(&set);
        assert!(result.ok);
        assert_eq!(result.added.len(), 1);

        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"203.0.113.1 # manually added\n")
            .unwrap();

        let parsed = writer.parse_existing().unwrap();
        assert!(parsed.contains(&"192.0.2.10".parse().unwrap()));
        assert!(parsed.contains(&"203.0.113.1".parse().unwrap()));
    }

    #[test]
    fn service_tag_and_bsd_style_formatting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.deny");
        let writer = DenyFileWriter::new(path.clone(), Some("sshd".to_string()), false);
        let mut set = HashSet::new();
        set.insert("192.0.2.10".parse::<Host>().unwrap());
        writer.apply(&set);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("sshd: 192.0.2.10"));
    }

    #[test]
    fn timestamp_wrapping_when_purging_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.deny");
        let writer = DenyFileWriter::new(path.clone(), None, true);
        let mut set = HashSet::new();
        set.insert("192.0.2.10".parse::<Host>().unwrap());
        writer.apply(&set);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with(DENY_DELIMITER));
    }

    #[test]
    fn open_failure_falls_back_to_stdout_with_ok_false() {
        // A directory path cannot be opened for append as a file.
        let dir = tempfile::tempdir().unwrap();
        let writer = DenyFileWriter::new(dir.path().to_path_buf(), None, false);
        let mut set = HashSet::new();
        set.insert("192.0.2.10".parse::<Host>().unwrap());
        let result = writer.apply(&set);
        assert!(!result.ok);
    }

    #[test]
    fn idempotent_when_already_denied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.deny");
        let writer = DenyFileWriter::new(path.clone(), None, false);
        let host: Host = "192.0.2.10".parse().unwrap();
        let mut set = HashSet::new();
        set.insert(host);
        writer.apply(&set);
        let parsed = writer.parse_existing().unwrap();
        assert_eq!(parsed.len(), 1);
        writer.apply(&set);
        let parsed_twice = writer.parse_existing().unwrap();
        // Parsing collapses duplicates into a set; caller is responsible
        // for not re-passing hosts already in the denied-set mirror.
        assert_eq!(parsed_twice.len(), 1);
    }

    #[test]
    fn rewrite_canonicalizes_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.deny");
        let writer = DenyFileWriter::new(path.clone(), None, false);

        let mut set = HashSet::new();
        set.insert("192.0.2.10".parse::<Host>().unwrap());
        set.insert("198.51.100.5".parse::<Host>().unwrap());
        writer.apply(&set);
        // Simulate accumulated cruft: duplicate entries and a stray
        // hand-written comment line.
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"192.0.2.10\n# note: watch this one\n")
            .unwrap();
        let before = writer.parse_existing().unwrap();
        assert_eq!(before, set);

        writer.rewrite(&before).unwrap();
        let after = writer.parse_existing().unwrap();
        assert_eq!(after, set);

        // A second rewrite of the same set is byte-for-byte identical.
        let contents_once = std::fs::read_to_string(&path).unwrap();
        writer.rewrite(&after).unwrap();
        let contents_twice = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents_once, contents_twice);
    }
}
