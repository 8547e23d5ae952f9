//! Rotation-aware, compression-aware byte-offset tracker for following
//! log files across daemon restarts and `logrotate` cycles.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SentrydError;

/// Sentinel offset meaning "force a rescan from zero next tick".
const ROTATED_SENTINEL: u64 = u64::MAX;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileState {
    inode: u64,
    offset: u64,
    first_line_hash: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedOffsets {
    files: HashMap<String, FileState>,
}

pub struct LogFollower {
    state_path: PathBuf,
    offsets: HashMap<String, FileState>,
}

fn hash_first_line(path: &Path) -> std::io::Result<Option<String>> {
    let f = File::open(path)?;
    let mut reader = BufReader::new(f);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let mut hasher = Sha256::new();
    hasher.update(line.as_bytes());
    Ok(Some(format!("{:x}", hasher.finalize())))
}

fn open_for_reading(path: &Path) -> std::io::Result<Box<dyn Read>> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let f = File::open(path)?;
    match ext {
        "gz" => Ok(Box::new(flate2::read::GzDecoder::new(f))),
        "bz2" => Ok(Box::new(bzip2::read::BzDecoder::new(f))),
        _ => Ok(Box::new(f)),
    }
}

impl LogFollower {
    pub fn load(work_dir: &Path) -> Result<Self, SentrydError> {
        let state_path = work_dir.join("offsets.json");
        let offsets = if state_path.exists() {
            let raw = std::fs::read_to_string(&state_path)
                .map_err(|e| SentrydError::io(state_path.display().to_string(), e))?;
            let persisted: PersistedOffsets =
                serde_json::from_str(&raw).map_err(|e| SentrydError::Parse(e.to_string()))?;
            persisted.files
        } else {
            HashMap::new()
        };
        Ok(Self { state_path, offsets })
    }

    pub fn persist(&self) -> Result<(), SentrydError> {
        let persisted = PersistedOffsets {
            files: self.offsets.clone(),
        };
        let raw = serde_json::to_string_pretty(&persisted).map_err(|e| SentrydError::Parse(e.to_string()))?;
        std::fs::write(&self.state_path, raw)
            .map_err(|e| SentrydError::io(self.state_path.display().to_string(), e))
    }

    /// Compare `path`'s current inode/size against the persisted state,
    /// handle rotation/truncation, and return the newly available lines,
    /// if any. Returns `Ok(None)` when the path is missing or no new
    /// data is available.
    pub fn poll(&mut self, path: &Path) -> Result<Option<Vec<String>>, SentrydError> {
        let key = path.to_string_lossy().to_string();

        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("log path {} missing, will retry next tick", path.display());
                return Ok(None);
            }
            Err(e) => return Err(SentrydError::io(path.display().to_string(), e)),
        };
        let inode = meta.ino();
        let size = meta.size();

        let state = self.offsets.entry(key.clone()).or_insert_with(|| FileState {
            inode,
            offset: 0,
            first_line_hash: None,
        });

        if state.inode != inode {
            // Rotation: reopen, force rescan from zero next tick.
            log::info!("rotation detected for {}: inode {} -> {}", path.display(), state.inode, inode);
            state.inode = inode;
            state.offset = ROTATED_SENTINEL;
            state.first_line_hash = hash_first_line(path)
                .map_err(|e| SentrydError::io(path.display().to_string(), e))?;
        }

        if state.offset == ROTATED_SENTINEL {
            state.offset = 0;
        }

        if size == 0 {
            // Rotated to empty: nothing to do this tick.
            return Ok(None);
        }

        if size < state.offset {
            // Truncated or rotated in place: reset and recheck next tick.
            state.offset = 0;
            state.first_line_hash = hash_first_line(path)
                .map_err(|e| SentrydError::io(path.display().to_string(), e))?;
            return Ok(None);
        }

        if size == state.offset {
            return Ok(None);
        }

        let mut reader = open_for_reading(path).map_err(|e| SentrydError::io(path.display().to_string(), e))?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .map_err(|e| SentrydError::io(path.display().to_string(), e))?;

        // Compressed streams don't expose a byte offset that maps onto
        // the compressed file's size, so for those we always replay from
        // the start of the decompressed stream and track progress by
        // line count instead of byte offset.
        let is_compressed = matches!(path.extension().and_then(|e| e.to_str()), Some("gz") | Some("bz2"));
        let text = String::from_utf8_lossy(&buf);
        let all_lines: Vec<&str> = text.lines().collect();

        let new_lines: Vec<String> = if is_compressed {
            let already = state.offset as usize;
            all_lines.iter().skip(already).map(|s| s.to_string()).collect()
        } else {
            let start = state.offset as usize;
            if start > buf.len() {
                Vec::new()
            } else {
                String::from_utf8_lossy(&buf[start..])
                    .lines()
                    .map(|s| s.to_string())
                    .collect()
            }
        };

        state.offset = if is_compressed {
            all_lines.len() as u64
        } else {
            buf.len() as u64
        };
        if state.first_line_hash.is_none() {
            state.first_line_hash = hash_first_line(path)
                .map_err(|e| SentrydError::io(path.display().to_string(), e))?;
        }

        if new_lines.is_empty() {
            Ok(None)
        } else {
            Ok(Some(new_lines))
        }
    }
}
