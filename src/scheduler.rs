//! Scheduler: single-threaded cooperative loop interleaving ingestion,
//! purge, and sync at cadences that are integer multiples of the base
//! tick. Purge and sync collaborators are invoked between ticks, never
//! inside ingestion's critical section.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::allowlist::AllowList;
use crate::classifier::{ClassifiedLine, Classifier};
use crate::config::Config;
use crate::denyfile::DenyFileWriter;
use crate::firewall::FirewallBackend;
use crate::follower::LogFollower;
use crate::report::{Delivery, Report};
use crate::store::AttemptStore;
use crate::sync::SyncTransport;
use crate::status::{SharedStatus, StatusSnapshot};

/// Shared shutdown flag, flipped by the `TERM` handler. The loop exits
/// only after completing the current tick.
pub type ShutdownFlag = Arc<AtomicBool>;

/// Shared debug-toggle flag, flipped by the `USR1` handler. 0 = info,
/// 1 = debug.
pub type DebugLevelFlag = Arc<AtomicU8>;

pub struct Scheduler {
    config: Config,
    classifier: Classifier,
    store: AttemptStore,
    allow_list: AllowList,
    deny_writer: DenyFileWriter,
    firewall: Box<dyn FirewallBackend>,
    follower: LogFollower,
    sync_transport: Option<Box<dyn SyncTransport>>,
    report: Report,
    status: SharedStatus,
    shutdown: ShutdownFlag,
    debug_level: DebugLevelFlag,
    foreground: bool,
    tick: u64,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        classifier: Classifier,
        store: AttemptStore,
        allow_list: AllowList,
        deny_writer: DenyFileWriter,
        firewall: Box<dyn FirewallBackend>,
        follower: LogFollower,
        sync_transport: Option<Box<dyn SyncTransport>>,
        status: SharedStatus,
        shutdown: ShutdownFlag,
        debug_level: DebugLevelFlag,
        foreground: bool,
    ) -> Self {
        Self {
            config,
            classifier,
            store,
            allow_list,
            deny_writer,
            firewall,
            follower,
            sync_transport,
            report: Report::new(),
            status,
            shutdown,
            debug_level,
            foreground,
            tick: 0,
        }
    }

    /// Run ticks until the shutdown flag is set. Each tick completes
    /// fully before the loop checks for shutdown again.
    pub fn run(&mut self) {
        if let Err(e) = self.firewall.init() {
            log::warn!("firewall init failed at startup: {e}");
        }

        let purge_interval = self.config.purge_tick_interval();
        let sync_interval = self.config.sync_tick_interval();

        while !self.shutdown.load(Ordering::SeqCst) {
            self.apply_debug_level();
            self.run_ingestion_tick();

            if let Some(interval) = purge_interval {
                if self.tick % interval == 0 {
                    self.run_purge();
                }
            }
            if let Some(interval) = sync_interval {
                if self.tick % interval == 0 {
                    self.run_sync();
                }
            }

            self.tick += 1;
            std::thread::sleep(self.config.daemon_sleep_duration());
        }
    }

    fn apply_debug_level(&self) {
        let level = if self.debug_level.load(Ordering::Relaxed) == 1 {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        log::set_max_level(level);
    }

    fn run_ingestion_tick(&mut self) {
        let now = Utc::now();
        let denied_before = match self.deny_writer.parse_existing() {
            Ok(set) => set,
            Err(e) => {
                log::error!("failed to read deny file: {e}");
                HashSet::new()
            }
        };

        let mut suspicious_lines = Vec::new();
        for log_path in self.config.log_files.clone() {
            match self.follower.poll(&log_path) {
                Ok(Some(lines)) => {
                    for line in lines {
                        match self.classifier.classify(&line) {
                            ClassifiedLine::Success { host, user } => {
                                self.store.record(host, user.as_deref(), true, false, now);
                            }
                            ClassifiedLine::Failure { host, user, invalid } => {
                                self.store.record(host, user.as_deref(), false, invalid, now);
                            }
                            ClassifiedLine::NoMatch => {}
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!("error following {}: {e}", log_path.display());
                    suspicious_lines.push(format!("follower error on {}: {e}", log_path.display()));
                }
            }
        }

        if let Err(e) = self.follower.persist() {
            log::error!("failed to persist log offsets: {e}");
        }

        // Surface hosts that slipped into the deny file despite being
        // allow-listed: scanned from the existing deny file, not from
        // this tick's new candidates.
        let mut allow_listed_warnings = Vec::new();
        for host in &denied_before {
            if self.allow_list.contains(host) && self.allow_list.mark_warned(*host) {
                allow_listed_warnings.push(host.to_string());
            }
        }

        let candidates = self.store.deny_candidates();
        let mut new_hosts = HashSet::new();
        for host in candidates {
            if self.allow_list.contains(&host) || denied_before.contains(&host) {
                continue;
            }
            new_hosts.insert(host);
        }

        // Deny file writes commit before firewall install: a crash
        // between the two leaves recoverable state.
        let apply_result = self.deny_writer.apply(&new_hosts);
        if !apply_result.ok {
            self.report.add_section("WARNING".to_string(), vec![
                "failed to open deny file, fell back to console output".to_string(),
            ]);
        }

        if !apply_result.added.is_empty() {
            self.run_plugin_deny(&apply_result.added);
        }

        let blocked = self.firewall.block(&apply_result.added);

        if let Err(e) = self.allow_list.persist() {
            log::error!("failed to persist allow-list warned hosts: {e}");
        }
        if let Err(e) = self.store.flush() {
            log::error!("failed to flush attempt store: {e}");
        }

        if !apply_result.added.is_empty() {
            self.report.add_section(
                "DENIED HOSTS".to_string(),
                apply_result.added.iter().map(|h| h.to_string()).collect(),
            );
        }
        if !allow_listed_warnings.is_empty() {
            self.report
                .add_section("ALLOW-LISTED HOSTS SEEN IN DENY FILE".to_string(), allow_listed_warnings);
        }
        let suspicious = self.store.suspicious();
        if self.config.suspicious_login_report_allowed_hosts && !suspicious.is_empty() {
            let items = suspicious
                .iter()
                .map(|(h, entries)| format!("{h}: {} suspicious logins", entries.len()))
                .collect();
            self.report.add_section("SUSPICIOUS LOGINS".to_string(), items);
        }
        if !suspicious_lines.is_empty() {
            self.report.add_section("ERRORS".to_string(), suspicious_lines);
        }

        self.flush_report();
        self.update_status(blocked);
    }

    /// Spawn the configured plugin with each newly denied host as an
    /// argument. Failures are logged and never block the tick.
    fn run_plugin_deny(&self, hosts: &[crate::host::Host]) {
        let Some(cmd) = &self.config.plugin_deny else { return };
        let args: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
        match std::process::Command::new(cmd).args(&args).output() {
            Ok(out) if !out.status.success() => log::error!(
                "plugin_deny {} exited with {}: {}",
                cmd.display(),
                out.status,
                String::from_utf8_lossy(&out.stderr)
            ),
            Ok(_) => {}
            Err(e) => log::error!("failed to spawn plugin_deny {}: {e}", cmd.display()),
        }
    }

    fn flush_report(&mut self) {
        let delivery = match (&self.config.smtp_host, &self.config.admin_email) {
            (Some(host), Some(to)) => Delivery::Email {
                smtp_host: host,
                smtp_port: self.config.smtp_port.unwrap_or(25),
                to,
            },
            _ if self.foreground => Delivery::Console,
            _ => Delivery::Silent,
        };
        self.report.flush(delivery, self.config.syslog_report);
    }

    fn update_status(&self, blocked: Vec<crate::host::Host>) {
        let mut snapshot = self.status.write().unwrap();
        *snapshot = StatusSnapshot {
            tracked_hosts: self.store.suspicious().len(),
            denied_hosts: self.deny_writer.parse_existing().unwrap_or_default().into_iter().collect(),
            blocked_hosts: blocked,
            last_tick: Some(Utc::now()),
        };
    }

    fn run_purge(&mut self) {
        if let Some(age_secs) = self.config.purge_deny {
            let evicted = self.store.purge(chrono::Duration::seconds(age_secs as i64), Utc::now());
            if evicted > 0 {
                log::info!("purge evicted {evicted} stale attempt records");
            }
            if let Err(e) = self.store.flush() {
                log::error!("failed to flush attempt store after purge: {e}");
            }
        }
    }

    fn run_sync(&mut self) {
        let Some(transport) = &self.sync_transport else { return };

        if self.config.sync_upload {
            let pending: Vec<crate::host::Host> = self
                .deny_writer
                .parse_existing()
                .unwrap_or_default()
                .into_iter()
                .collect();
            if let Err(e) = crate::sync::write_staging_file(&self.config.work_dir, &pending) {
                log::error!("failed to write sync staging file: {e}");
            }
            match transport.send_new_hosts(&pending) {
                Ok(_) => {}
                // Don't advance sync state on failure; next tick retries.
                Err(e) => log::error!("sync upload failed: {e}"),
            }
        }

        if self.config.sync_download {
            match transport.receive_new_hosts() {
                Ok(downloaded) => {
                    let denied_before = self.deny_writer.parse_existing().unwrap_or_default();
                    let new_hosts: HashSet<_> = downloaded
                        .into_iter()
                        .filter(|h| !self.allow_list.contains(h) && !denied_before.contains(h))
                        .collect();
                    let result = self.deny_writer.apply(&new_hosts);
                    self.firewall.block(&result.added);
                }
                Err(e) => log::error!("sync download failed: {e}"),
            }
        }
    }
}

/// Registers `SIGTERM` (shutdown) and `SIGUSR1` (toggle debug logging)
/// handlers.
pub fn install_signal_handlers(shutdown: ShutdownFlag, debug_level: DebugLevelFlag) -> anyhow::Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown)?;
    let debug_level_for_toggle = debug_level.clone();
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGUSR1, move || {
            let current = debug_level_for_toggle.load(Ordering::Relaxed);
            debug_level_for_toggle.store(1 - current, Ordering::Relaxed);
        })?;
    }
    Ok(())
}

pub fn work_dir_path(config: &Config, filename: &str) -> PathBuf {
    config.work_dir.join(filename)
}
