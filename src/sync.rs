//! Push/pull interface for exchanging known-bad hosts with peers over
//! HTTP, plus a staging file written before each upload.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SentrydError;
use crate::host::Host;

#[derive(Debug, Serialize, Deserialize)]
struct UploadRequest {
    hosts: Vec<Host>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UploadResponse {
    acknowledged_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DownloadResponse {
    hosts: Vec<Host>,
}

pub trait SyncTransport: Send + Sync {
    fn send_new_hosts(&self, hosts: &[Host]) -> Result<DateTime<Utc>, SentrydError>;
    fn receive_new_hosts(&self) -> Result<HashSet<Host>, SentrydError>;
}

pub struct HttpSyncTransport {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpSyncTransport {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl SyncTransport for HttpSyncTransport {
    fn send_new_hosts(&self, hosts: &[Host]) -> Result<DateTime<Utc>, SentrydError> {
        let resp = self
            .client
            .post(format!("{}/sync/upload", self.base_url))
            .json(&UploadRequest {
                hosts: hosts.to_vec(),
            })
            .send()
            .map_err(|e| SentrydError::Sync(e.to_string()))?;
        let body: UploadResponse = resp.json().map_err(|e| SentrydError::Sync(e.to_string()))?;
        Ok(body.acknowledged_at)
    }

    fn receive_new_hosts(&self) -> Result<HashSet<Host>, SentrydError> {
        let resp = self
            .client
            .get(format!("{}/sync/download", self.base_url))
            .send()
            .map_err(|e| SentrydError::Sync(e.to_string()))?;
        let body: DownloadResponse = resp.json().map_err(|e| SentrydError::Sync(e.to_string()))?;
        Ok(body.hosts.into_iter().collect())
    }
}

/// Writes pending hosts to a staging file under the working directory
/// before upload, so a crash mid-upload leaves a record of what was sent.
pub fn write_staging_file(work_dir: &Path, hosts: &[Host]) -> Result<(), SentrydError> {
    let path = work_dir.join("sync-hosts.json");
    let raw = serde_json::to_string_pretty(hosts).map_err(|e| SentrydError::Parse(e.to_string()))?;
    std::fs::write(&path, raw).map_err(|e| SentrydError::io(path.display().to_string(), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o644);
        std::fs::set_permissions(&path, perms)
            .map_err(|e| SentrydError::io(path.display().to_string(), e))?;
    }
    Ok(())
}

/// Test double: uploads are accepted idempotently, downloads return a
/// fixed set.
pub struct NullSyncTransport {
    pub downloadable: HashSet<Host>,
    pub uploaded: std::sync::Mutex<HashSet<Host>>,
}

impl NullSyncTransport {
    pub fn new(downloadable: HashSet<Host>) -> Self {
        Self {
            downloadable,
            uploaded: std::sync::Mutex::new(HashSet::new()),
        }
    }
}

impl SyncTransport for NullSyncTransport {
    fn send_new_hosts(&self, hosts: &[Host]) -> Result<DateTime<Utc>, SentrydError> {
        let mut uploaded = self.uploaded.lock().unwrap();
        for host in hosts {
            uploaded.insert(*host);
        }
        Ok(Utc::now())
    }

    fn receive_new_hosts(&self) -> Result<HashSet<Host>, SentrydError> {
        Ok(self.downloadable.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let host: Host = "192.0.2.10".parse().unwrap();
        write_staging_file(dir.path(), &[host]).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("sync-hosts.json")).unwrap();
        let hosts: Vec<Host> = serde_json::from_str(&raw).unwrap();
        assert_eq!(hosts, vec![host]);
    }

    #[test]
    fn reupload_is_idempotent() {
        let transport = NullSyncTransport::new(HashSet::new());
        let host: Host = "192.0.2.10".parse().unwrap();
        transport.send_new_hosts(&[host]).unwrap();
        transport.send_new_hosts(&[host]).unwrap();
        assert_eq!(transport.uploaded.lock().unwrap().len(), 1);
    }

    #[test]
    fn download_merges_into_denied_set() {
        let mut downloadable = HashSet::new();
        let host: Host = "198.51.100.5".parse().unwrap();
        downloadable.insert(host);
        let transport = NullSyncTransport::new(downloadable);
        let received = transport.receive_new_hosts().unwrap();
        assert!(received.contains(&host));
    }
}
