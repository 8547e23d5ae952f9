//! Firewall Reconciler: idempotent add/check against iptables+ipset or
//! PF, via subprocess invocation. Each host is a separate subprocess
//! call; errors are logged per host and never abort the batch.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

use crate::host::Host;

pub trait FirewallBackend: Send + Sync {
    /// Ensure the backend's underlying set/chain/table exists. Called
    /// once at startup and retried on each block attempt.
    fn init(&self) -> anyhow::Result<()>;

    /// Membership query. Fails open (`false`) on any error, since the
    /// deny file still protects independently of the firewall.
    fn check(&self, host: &Host) -> bool;

    /// Install blocking rules for `hosts`. Never rolls back; errors are
    /// logged per host.
    fn block(&self, hosts: &[Host]) -> Vec<Host>;
}

fn run(cmd: &str, args: &[&str]) -> anyhow::Result<std::process::Output> {
    Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| anyhow::anyhow!("failed to spawn {cmd}: {e}"))
}

/// Set-based backend: iptables rule jumping to an ipset `hash:ip` set.
pub struct IpsetBackend {
    iptables: PathBuf,
    ipset: PathBuf,
    set_name: String,
    block_port: Option<u16>,
}

impl IpsetBackend {
    pub fn new(iptables: PathBuf, ipset: PathBuf, set_name: String, block_port: Option<u16>) -> Self {
        Self {
            iptables,
            ipset,
            set_name,
            block_port,
        }
    }

    fn ensure_rule(&self) -> anyhow::Result<()> {
        let mut args = vec!["-C", "INPUT"];
        let port_str;
        if let Some(port) = self.block_port {
            port_str = port.to_string();
            args.extend(["-p", "tcp", "--dport", &port_str]);
        }
        args.extend(["-m", "set", "--match-set", &self.set_name, "src", "-j", "DROP"]);
        let check = run(self.iptables.to_string_lossy().as_ref(), &args)?;
        if check.status.success() {
            return Ok(());
        }
        let mut insert_args = vec!["-I", "INPUT"];
        if let Some(port) = self.block_port {
            insert_args.extend(["-p", "tcp", "--dport", &port_str]);
        }
        insert_args.extend(["-m", "set", "--match-set", &self.set_name, "src", "-j", "DROP"]);
        run(self.iptables.to_string_lossy().as_ref(), &insert_args)?;
        Ok(())
    }
}

impl FirewallBackend for IpsetBackend {
    fn init(&self) -> anyhow::Result<()> {
        run(
            self.ipset.to_string_lossy().as_ref(),
            &["create", &self.set_name, "hash:ip", "-exist"],
        )?;
        self.ensure_rule()
    }

    fn check(&self, host: &Host) -> bool {
        let host_str = host.to_string();
        match run(self.ipset.to_string_lossy().as_ref(), &["test", &self.set_name, &host_str]) {
            Ok(out) => out.status.success(),
            Err(e) => {
                log::warn!("ipset check failed for {host}: {e}");
                false
            }
        }
    }

    fn block(&self, hosts: &[Host]) -> Vec<Host> {
        if let Err(e) = self.init() {
            log::warn!("ipset init failed: {e}");
        }
        let mut blocked = Vec::new();
        for host in hosts {
            let host_str = host.to_string();
            match run(self.ipset.to_string_lossy().as_ref(), &["add", &self.set_name, &host_str, "-exist"]) {
                Ok(out) if out.status.success() => blocked.push(*host),
                Ok(out) => log::error!(
                    "ipset add {host} failed: {}",
                    String::from_utf8_lossy(&out.stderr)
                ),
                Err(e) => log::error!("ipset add {host} failed to spawn: {e}"),
            }
        }
        blocked
    }
}

/// Rule-based backend: one standalone INPUT-chain rule per host.
pub struct IptablesRulesBackend {
    iptables: PathBuf,
    block_port: Option<u16>,
}

impl IptablesRulesBackend {
    pub fn new(iptables: PathBuf, block_port: Option<u16>) -> Self {
        Self { iptables, block_port }
    }

    fn args_for(&self, flag: &str, host_str: &str) -> Vec<String> {
        let mut args = vec![flag.to_string(), "INPUT".to_string(), "-s".to_string(), host_str.to_string()];
        if let Some(port) = self.block_port {
            args.extend(["-p".to_string(), "tcp".to_string(), "--dport".to_string(), port.to_string()]);
        }
        args.extend(["-j".to_string(), "DROP".to_string()]);
        args
    }
}

impl FirewallBackend for IptablesRulesBackend {
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn check(&self, host: &Host) -> bool {
        let host_str = host.to_string();
        let args = self.args_for("-C", &host_str);
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        match run(self.iptables.to_string_lossy().as_ref(), &args_ref) {
            Ok(out) => out.status.success(),
            Err(e) => {
                log::warn!("iptables check failed for {host}: {e}");
                false
            }
        }
    }

    fn block(&self, hosts: &[Host]) -> Vec<Host> {
        let mut blocked = Vec::new();
        for host in hosts {
            if self.check(host) {
                blocked.push(*host);
                continue;
            }
            let host_str = host.to_string();
            let args = self.args_for("-I", &host_str);
            let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
            match run(self.iptables.to_string_lossy().as_ref(), &args_ref) {
                Ok(out) if out.status.success() => blocked.push(*host),
                Ok(out) => log::error!(
                    "iptables insert for {host} failed: {}",
                    String::from_utf8_lossy(&out.stderr)
                ),
                Err(e) => log::error!("iptables insert for {host} failed to spawn: {e}"),
            }
        }
        blocked
    }
}

/// PF backend: named table, with an optional flat file for reboot
/// persistence. `check` shells out to `pfctl -t <table> -T show` and
/// scans its output.
pub struct PfBackend {
    pfctl: PathBuf,
    table: String,
    table_file: Option<PathBuf>,
    /// Appends to `table_file` are serialized to avoid interleaved
    /// partial writes when `block` is called concurrently.
    file_lock: Mutex<()>,
}

impl PfBackend {
    pub fn new(pfctl: PathBuf, table: String, table_file: Option<PathBuf>) -> Self {
        Self {
            pfctl,
            table,
            table_file,
            file_lock: Mutex::new(()),
        }
    }

    fn append_to_table_file(&self, hosts: &[Host]) {
        let Some(path) = &self.table_file else { return };
        let _guard = self.file_lock.lock().unwrap();
        use std::io::Write as _;
        let file = std::fs::OpenOptions::new().append(true).create(true).open(path);
        match file {
            Ok(mut f) => {
                for host in hosts {
                    if let Err(e) = writeln!(f, "{host}") {
                        log::error!("failed to append {host} to PF table file: {e}");
                    }
                }
            }
            Err(e) => log::error!("failed to open PF table file {}: {e}", path.display()),
        }
    }
}

impl FirewallBackend for PfBackend {
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn check(&self, host: &Host) -> bool {
        let out = match run(self.pfctl.to_string_lossy().as_ref(), &["-t", &self.table, "-T", "show"]) {
            Ok(out) if out.status.success() => out,
            Ok(_) | Err(_) => return false,
        };
        let host_str = host.to_string();
        String::from_utf8_lossy(&out.stdout)
            .lines()
            .any(|l| l.trim() == host_str)
    }

    fn block(&self, hosts: &[Host]) -> Vec<Host> {
        let mut blocked = Vec::new();
        for host in hosts {
            let host_str = host.to_string();
            match run(
                self.pfctl.to_string_lossy().as_ref(),
                &["-t", &self.table, "-T", "add", &host_str],
            ) {
                Ok(_) => blocked.push(*host),
                Err(e) => log::error!("pfctl add {host} failed to spawn: {e}"),
            }
        }
        self.append_to_table_file(hosts);
        blocked
    }
}

/// Test double recording calls without touching the system firewall.
pub struct NullBackend {
    pub blocked: Mutex<HashSet<Host>>,
}

impl Default for NullBackend {
    fn default() -> Self {
        Self {
            blocked: Mutex::new(HashSet::new()),
        }
    }
}

impl FirewallBackend for NullBackend {
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn check(&self, host: &Host) -> bool {
        self.blocked.lock().unwrap().contains(host)
    }

    fn block(&self, hosts: &[Host]) -> Vec<Host> {
        let mut set = self.blocked.lock().unwrap();
        for host in hosts {
            set.insert(*host);
        }
        hosts.to_vec()
    }
}
