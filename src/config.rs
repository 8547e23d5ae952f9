//! TOML file + `SENTRYD_`-prefixed environment overrides, loaded into a
//! validated [`Config`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SentrydError;

fn default_daemon_sleep() -> u64 {
    30
}

fn default_sync_interval() -> u64 {
    3600
}

/// Sync runs less often than once an hour; anything shorter is clamped up.
const SYNC_MIN_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub work_dir: PathBuf,
    pub hosts_deny: PathBuf,
    #[serde(default)]
    pub block_service: Option<String>,
    #[serde(default)]
    pub purge_deny: Option<u64>,
    #[serde(default = "default_daemon_sleep")]
    pub daemon_sleep: u64,
    #[serde(default)]
    pub daemon_purge: Option<u64>,
    #[serde(default)]
    pub sync_server: Option<String>,
    #[serde(default)]
    pub sync_upload: bool,
    #[serde(default)]
    pub sync_download: bool,
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,

    #[serde(default)]
    pub iptables: Option<PathBuf>,
    #[serde(default)]
    pub ipset_command: Option<PathBuf>,
    #[serde(default)]
    pub ipset_name: Option<String>,
    #[serde(default)]
    pub blockport: Option<u16>,
    #[serde(default)]
    pub pfctl_path: Option<PathBuf>,
    #[serde(default)]
    pub pf_table: Option<String>,
    #[serde(default)]
    pub pf_table_file: Option<PathBuf>,

    #[serde(default)]
    pub hostname_lookup: bool,
    #[serde(default)]
    pub syslog_report: bool,
    #[serde(default)]
    pub detect_dovecot_login_attempts: bool,
    #[serde(default)]
    pub suspicious_login_report_allowed_hosts: bool,

    #[serde(default)]
    pub sshd_format_regex: Option<String>,
    #[serde(default)]
    pub successful_entry_regex: Option<String>,
    #[serde(default)]
    pub failed_entry_regex: Vec<String>,
    #[serde(default)]
    pub failed_dovecot_entry_regex: Option<String>,
    #[serde(default)]
    pub userdef_failed_entry_regex: Vec<String>,

    #[serde(default)]
    pub deny_threshold_invalid: Option<u32>,
    #[serde(default)]
    pub deny_threshold_valid: Option<u32>,
    #[serde(default)]
    pub deny_threshold_root: Option<u32>,
    #[serde(default)]
    pub deny_threshold_restricted: Option<u32>,
    #[serde(default)]
    pub restricted_users: Vec<String>,

    /// External command run with newly denied hosts as arguments.
    /// Failures are logged and never block the tick.
    #[serde(default)]
    pub plugin_deny: Option<PathBuf>,

    #[serde(default)]
    pub log_files: Vec<PathBuf>,
    #[serde(default)]
    pub allowed_hosts_file: Option<PathBuf>,

    #[serde(default)]
    pub bind_addr: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,

    /// Left unset, reports fall back to console (when in the foreground)
    /// or syslog.
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default)]
    pub smtp_port: Option<u16>,
    #[serde(default)]
    pub admin_email: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, SentrydError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SentrydError::io(path.display().to_string(), e))?;
        let mut cfg: Config =
            toml::from_str(&raw).map_err(|e| SentrydError::Parse(e.to_string()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// `SENTRYD_<KEY>` environment variables override file values,
    /// matching the pack-wide convention of config-plus-env layering.
    fn apply_env_overrides(&mut self) {
        let env: HashMap<String, String> = std::env::vars().collect();
        if let Some(v) = env.get("SENTRYD_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = env.get("SENTRYD_HOSTS_DENY") {
            self.hosts_deny = PathBuf::from(v);
        }
        if let Some(v) = env.get("SENTRYD_DAEMON_SLEEP") {
            if let Ok(n) = v.parse() {
                self.daemon_sleep = n;
            }
        }
        if let Some(v) = env.get("SENTRYD_SYNC_SERVER") {
            self.sync_server = Some(v.clone());
        }
        if let Some(v) = env.get("SENTRYD_LOG_LEVEL") {
            self.log_level = Some(v.clone());
        }
    }

    fn validate(&mut self) -> Result<(), SentrydError> {
        if self.sync_interval < SYNC_MIN_INTERVAL_SECS {
            self.sync_interval = SYNC_MIN_INTERVAL_SECS;
        }
        if self.daemon_sleep == 0 {
            return Err(SentrydError::Configuration(
                "daemon_sleep must be non-zero".into(),
            ));
        }
        if self.log_files.is_empty() {
            return Err(SentrydError::Configuration(
                "at least one entry required in log_files".into(),
            ));
        }
        Ok(())
    }

    pub fn daemon_sleep_duration(&self) -> Duration {
        Duration::from_secs(self.daemon_sleep)
    }

    /// Number of ticks between purge runs.
    pub fn purge_tick_interval(&self) -> Option<u64> {
        self.daemon_purge
            .map(|secs| secs.div_ceil(self.daemon_sleep).max(1))
    }

    /// Number of ticks between sync runs.
    pub fn sync_tick_interval(&self) -> Option<u64> {
        if self.sync_server.is_none() {
            return None;
        }
        Some(self.sync_interval.div_ceil(self.daemon_sleep).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> &'static str {
        r#"
        work_dir = "/var/lib/sentryd"
        hosts_deny = "/etc/hosts.deny"
        log_files = ["/var/log/auth.log"]
        "#
    }

    #[test]
    fn loads_minimal_config() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{}", minimal_toml()).unwrap();
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.daemon_sleep, 30);
        assert_eq!(cfg.sync_interval, SYNC_MIN_INTERVAL_SECS);
    }

    #[test]
    fn rejects_empty_log_files() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"work_dir = "/tmp/a"
hosts_deny = "/tmp/b"
log_files = []
"#
        )
        .unwrap();
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn clamps_sync_interval_to_minimum() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"work_dir = "/tmp/a"
hosts_deny = "/tmp/b"
log_files = ["/tmp/auth.log"]
sync_interval = 10
"#
        )
        .unwrap();
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.sync_interval, SYNC_MIN_INTERVAL_SECS);
    }
}
