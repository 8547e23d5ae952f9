//! Matches a raw log line against an ordered set of regexes and
//! extracts `{user, host, success, invalid}`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::host::Host;

/// Default sshd syslog envelope: `sshd[1234]: <message>`.
pub static DEFAULT_SSHD_FORMAT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^sshd(?:\[\d+\])?:\s*(?P<message>.+)$").unwrap()
});

pub static DEFAULT_SUCCESSFUL_ENTRY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^Accepted\s+\w+\s+for\s+(?P<user>\S+)\s+from\s+(?P<host>[0-9A-Fa-f:.]+)\s+port\s+\d+",
    )
    .unwrap()
});

/// Ordered failed-entry regexes, tried in sequence until one matches.
/// The first entry matches the "invalid user" phrasing explicitly so
/// `invalid` is set.
pub static DEFAULT_FAILED_ENTRY_REGEXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(
            r"(?x)^Failed\s+\w+\s+for\s+(?P<invalid>invalid\s+user\s+)(?P<user>\S+)\s+from\s+(?P<host>[0-9A-Fa-f:.]+)\s+port\s+\d+",
        )
        .unwrap(),
        Regex::new(
            r"(?x)^Failed\s+\w+\s+for\s+(?P<user>\S+)\s+from\s+(?P<host>[0-9A-Fa-f:.]+)\s+port\s+\d+",
        )
        .unwrap(),
        Regex::new(
            r"(?x)^Failed\s+keyboard-interactive/pam\s+for\s+(?P<user>\S+)\s+from\s+(?P<host>[0-9A-Fa-f:.]+)\s+port\s+\d+",
        )
        .unwrap(),
        Regex::new(
            r"(?x)^User\s+(?P<user>\S+)\s+from\s+(?P<host>[0-9A-Fa-f:.]+)\s+not\s+allowed\s+because",
        )
        .unwrap(),
        Regex::new(
            r"(?x)^(?P<invalid>Invalid\s+user\s+)(?P<user>\S+)\s+from\s+(?P<host>[0-9A-Fa-f:.]+)",
        )
        .unwrap(),
    ]
});

pub static DEFAULT_DOVECOT_FAILED_ENTRY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^(?:imap|pop3)-login:\s+Authentication\s+failure.*user=<(?P<user>[^>]*)>.*rip=(?P<host>[0-9A-Fa-f:.]+)",
    )
    .unwrap()
});

/// Outcome of classifying one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedLine {
    NoMatch,
    Success {
        host: Host,
        user: Option<String>,
    },
    Failure {
        host: Host,
        user: Option<String>,
        invalid: bool,
    },
}

pub struct Classifier {
    sshd_envelope: Regex,
    success_regex: Regex,
    failed_entry_regexes: Vec<Regex>,
    dovecot_failed_entry_regex: Option<Regex>,
    userdef_failed_entry_regexes: Vec<Regex>,
    detect_dovecot: bool,
}

impl Classifier {
    pub fn new(
        sshd_envelope: Option<Regex>,
        success_regex: Option<Regex>,
        failed_entry_regexes: Vec<Regex>,
        dovecot_failed_entry_regex: Option<Regex>,
        userdef_failed_entry_regexes: Vec<Regex>,
        detect_dovecot: bool,
    ) -> Self {
        Self {
            sshd_envelope: sshd_envelope.unwrap_or_else(|| DEFAULT_SSHD_FORMAT_REGEX.clone()),
            success_regex: success_regex.unwrap_or_else(|| DEFAULT_SUCCESSFUL_ENTRY_REGEX.clone()),
            failed_entry_regexes: if failed_entry_regexes.is_empty() {
                DEFAULT_FAILED_ENTRY_REGEXES.clone()
            } else {
                failed_entry_regexes
            },
            dovecot_failed_entry_regex: dovecot_failed_entry_regex
                .or_else(|| detect_dovecot.then(|| DEFAULT_DOVECOT_FAILED_ENTRY_REGEX.clone())),
            userdef_failed_entry_regexes,
            detect_dovecot,
        }
    }

    pub fn default_classifier() -> Self {
        Self::new(None, None, Vec::new(), None, Vec::new(), false)
    }

    /// Tries the sshd envelope first, then failed-entry regexes in
    /// order, then the success regex; falls back to Dovecot (if
    /// enabled) or user-defined regexes when the envelope doesn't match.
    pub fn classify(&self, line: &str) -> ClassifiedLine {
        if let Some(caps) = self.sshd_envelope.captures(line) {
            let message = caps.name("message").map(|m| m.as_str()).unwrap_or(line);

            for re in &self.failed_entry_regexes {
                if let Some(caps) = re.captures(message) {
                    return self.failure_from_caps(&caps);
                }
            }
            if let Some(caps) = self.success_regex.captures(message) {
                return self.success_from_caps(&caps);
            }
            return ClassifiedLine::NoMatch;
        }

        if self.detect_dovecot {
            if let Some(re) = &self.dovecot_failed_entry_regex {
                if let Some(caps) = re.captures(line) {
                    return self.failure_from_caps(&caps);
                }
            }
        }

        for re in &self.userdef_failed_entry_regexes {
            if let Some(caps) = re.captures(line) {
                return self.failure_from_caps(&caps);
            }
        }

        ClassifiedLine::NoMatch
    }

    fn failure_from_caps(&self, caps: &regex::Captures) -> ClassifiedLine {
        let Some(host_match) = caps.name("host") else {
            log::warn!("matched failed-entry regex without a `host` group, skipping line");
            return ClassifiedLine::NoMatch;
        };
        let host = match host_match.as_str().parse::<Host>() {
            Ok(h) => h,
            Err(_) => {
                log::warn!("failed-entry host {:?} did not parse as an address", host_match.as_str());
                return ClassifiedLine::NoMatch;
            }
        };
        let user = caps.name("user").map(|m| m.as_str().to_string());
        let invalid = is_invalid(caps);
        ClassifiedLine::Failure { host, user, invalid }
    }

    fn success_from_caps(&self, caps: &regex::Captures) -> ClassifiedLine {
        let Some(host_match) = caps.name("host") else {
            log::warn!("matched success regex without a `host` group, skipping line");
            return ClassifiedLine::NoMatch;
        };
        let host = match host_match.as_str().parse::<Host>() {
            Ok(h) => h,
            Err(_) => {
                log::warn!("success host {:?} did not parse as an address", host_match.as_str());
                return ClassifiedLine::NoMatch;
            }
        };
        let user = caps.name("user").map(|m| m.as_str().to_string());
        ClassifiedLine::Success { host, user }
    }
}

/// True iff the named group `invalid` matched and captured non-empty text.
fn is_invalid(caps: &regex::Captures) -> bool {
    caps.name("invalid").is_some_and(|m| !m.as_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_invalid_user_failure() {
        let c = Classifier::default_classifier();
        let line = "sshd[1234]: Failed password for invalid user admin from 192.0.2.10 port 4444 ssh2";
        match c.classify(line) {
            ClassifiedLine::Failure { host, user, .. } => {
                assert_eq!(host.to_string(), "192.0.2.10");
                assert_eq!(user.as_deref(), Some("admin"));
            }
            other => panic!("expected Failure, got {other:?}"),
        }
    }

    #[test]
    fn classifies_valid_user_failure() {
        let c = Classifier::default_classifier();
        let line = "sshd[1234]: Failed password for root from 198.51.100.5 port 22 ssh2";
        match c.classify(line) {
            ClassifiedLine::Failure { host, user, invalid } => {
                assert_eq!(host.to_string(), "198.51.100.5");
                assert_eq!(user.as_deref(), Some("root"));
                assert!(!invalid);
            }
            other => panic!("expected Failure, got {other:?}"),
        }
    }

    #[test]
    fn classifies_success() {
        let c = Classifier::default_classifier();
        let line = "sshd[1234]: Accepted password for alice from 203.0.113.7 port 22 ssh2";
        match c.classify(line) {
            ClassifiedLine::Success { host, user } => {
                assert_eq!(host.to_string(), "203.0.113.7");
                assert_eq!(user.as_deref(), Some("alice"));
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn no_match_on_unrelated_line() {
        let c = Classifier::default_classifier();
        assert_eq!(c.classify("sshd[1234]: session opened for user alice"), ClassifiedLine::NoMatch);
    }

    #[test]
    fn dovecot_detected_when_enabled() {
        let c = Classifier::new(None, None, Vec::new(), None, Vec::new(), true);
        let line = "dovecot: imap-login: Authentication failure user=<bob> rip=192.0.2.20";
        match c.classify(line) {
            ClassifiedLine::Failure { host, user, .. } => {
                assert_eq!(host.to_string(), "192.0.2.20");
                assert_eq!(user.as_deref(), Some("bob"));
            }
            other => panic!("expected Failure, got {other:?}"),
        }
    }

    #[test]
    fn dovecot_ignored_when_disabled() {
        let c = Classifier::default_classifier();
        let line = "dovecot: imap-login: Authentication failure user=<bob> rip=192.0.2.20";
        assert_eq!(c.classify(line), ClassifiedLine::NoMatch);
    }

    #[test]
    fn malformed_host_is_skipped() {
        let c = Classifier::new(
            None,
            None,
            vec![Regex::new(r"^bogus (?P<user>\S+) (?P<host>\S+)$").unwrap()],
            None,
            Vec::new(),
            false,
        );
        assert_eq!(c.classify("bogus alice not-an-ip"), ClassifiedLine::NoMatch);
    }

    #[test]
    fn missing_host_group_is_skipped() {
        let c = Classifier::new(
            None,
            None,
            vec![Regex::new(r"^nohost (?P<user>\S+)$").unwrap()],
            None,
            Vec::new(),
            false,
        );
        assert_eq!(c.classify("nohost alice"), ClassifiedLine::NoMatch);
    }
}
