use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use sentryd::allowlist::AllowList;
use sentryd::classifier::Classifier;
use sentryd::config::Config;
use sentryd::denyfile::DenyFileWriter;
use sentryd::firewall::{FirewallBackend, IpsetBackend, IptablesRulesBackend, NullBackend, PfBackend};
use sentryd::follower::LogFollower;
use sentryd::lockfile::LockFile;
use sentryd::scheduler::{install_signal_handlers, Scheduler};
use sentryd::status::{SharedStatus, StatusSnapshot};
use sentryd::store::{AttemptStore, Thresholds};
use sentryd::sync::{HttpSyncTransport, SyncTransport};

/// Host-based intrusion-prevention daemon: watches auth logs for
/// brute-force hosts and installs persistent deny rules.
#[derive(Parser)]
#[command(name = "sentryd", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/sentryd/sentryd.toml")]
    config: PathBuf,

    /// Run in the foreground instead of daemonizing the tick loop.
    #[arg(long)]
    foreground: bool,

    /// Ignore any persisted log offsets and rescan from byte zero.
    #[arg(long)]
    ignore_offset: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one purge pass against the attempt store and exit.
    Purge,
    /// Add a host to the allow-list file and exit.
    AllowHost { host: String },
}

fn build_firewall(config: &Config) -> Box<dyn FirewallBackend> {
    if let (Some(ipset), Some(set_name), Some(iptables)) =
        (&config.ipset_command, &config.ipset_name, &config.iptables)
    {
        return Box::new(IpsetBackend::new(
            iptables.clone(),
            ipset.clone(),
            set_name.clone(),
            config.blockport,
        ));
    }
    if let Some(iptables) = &config.iptables {
        return Box::new(IptablesRulesBackend::new(iptables.clone(), config.blockport));
    }
    if let (Some(pfctl), Some(table)) = (&config.pfctl_path, &config.pf_table) {
        return Box::new(PfBackend::new(pfctl.clone(), table.clone(), config.pf_table_file.clone()));
    }
    log::warn!("no firewall backend configured, using a no-op test double");
    Box::new(NullBackend::default())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).context("failed to load configuration")?;

    let level = config.log_level.as_deref().unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    std::fs::create_dir_all(&config.work_dir).context("failed to create working directory")?;

    match &cli.command {
        Some(Command::Purge) => {
            let thresholds = thresholds_from_config(&config);
            let mut store = AttemptStore::load(&config.work_dir, thresholds)?;
            let age = config.purge_deny.unwrap_or(0);
            let evicted = store.purge(chrono::Duration::seconds(age as i64), chrono::Utc::now());
            store.flush()?;
            println!("purged {evicted} stale attempt records");
            return Ok(());
        }
        Some(Command::AllowHost { host }) => {
            let path = config
                .allowed_hosts_file
                .clone()
                .context("allowed_hosts_file not configured")?;
            let mut contents = std::fs::read_to_string(&path).unwrap_or_default();
            contents.push_str(host);
            contents.push('\n');
            std::fs::write(&path, contents)?;
            println!("added {host} to allow-list");
            return Ok(());
        }
        None => {}
    }

    let lock = LockFile::acquire(config.work_dir.join("sentryd.lock"))?;

    if cli.ignore_offset {
        let _ = std::fs::remove_file(config.work_dir.join("offsets.json"));
    }

    let classifier = Classifier::new(
        config
            .sshd_format_regex
            .as_deref()
            .map(|p| regex::Regex::new(p))
            .transpose()?,
        config
            .successful_entry_regex
            .as_deref()
            .map(|p| regex::Regex::new(p))
            .transpose()?,
        config
            .failed_entry_regex
            .iter()
            .map(|p| regex::Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?,
        config
            .failed_dovecot_entry_regex
            .as_deref()
            .map(|p| regex::Regex::new(p))
            .transpose()?,
        config
            .userdef_failed_entry_regex
            .iter()
            .map(|p| regex::Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?,
        config.detect_dovecot_login_attempts,
    );

    let thresholds = thresholds_from_config(&config);
    let store = AttemptStore::load(&config.work_dir, thresholds)?;
    let allow_list = AllowList::load(config.allowed_hosts_file.as_deref(), &config.work_dir)?;
    let deny_writer = DenyFileWriter::new(
        config.hosts_deny.clone(),
        config.block_service.clone(),
        config.purge_deny.is_some(),
    );
    let firewall = build_firewall(&config);
    let follower = LogFollower::load(&config.work_dir)?;
    let sync_transport: Option<Box<dyn SyncTransport>> = config
        .sync_server
        .clone()
        .map(|url| Box::new(HttpSyncTransport::new(url)) as Box<dyn SyncTransport>);

    let status: SharedStatus = Arc::new(RwLock::new(StatusSnapshot::default()));
    let shutdown = Arc::new(AtomicBool::new(false));
    let debug_level = Arc::new(AtomicU8::new(0));
    install_signal_handlers(shutdown.clone(), debug_level.clone())?;

    let bind_addr: std::net::SocketAddr = config
        .bind_addr
        .clone()
        .unwrap_or_else(|| "127.0.0.1:8483".to_string())
        .parse()
        .context("invalid bind_addr")?;

    let runtime = tokio::runtime::Runtime::new()?;
    let status_for_server = status.clone();
    runtime.spawn(async move {
        if let Err(e) = sentryd::status::serve(bind_addr, status_for_server).await {
            log::error!("status server exited: {e}");
        }
    });

    let mut scheduler = Scheduler::new(
        config,
        classifier,
        store,
        allow_list,
        deny_writer,
        firewall,
        follower,
        sync_transport,
        status,
        shutdown,
        debug_level,
        cli.foreground,
    );

    if !cli.foreground {
        log::info!("starting sentryd tick loop (not detaching from controlling terminal; use your process supervisor to daemonize)");
    }
    scheduler.run();

    lock.release();
    Ok(())
}

fn thresholds_from_config(config: &Config) -> Thresholds {
    Thresholds {
        invalid: config.deny_threshold_invalid,
        valid: config.deny_threshold_valid,
        root: config.deny_threshold_root,
        restricted: config.deny_threshold_restricted,
        restricted_users: config.restricted_users.iter().cloned().collect(),
    }
}
