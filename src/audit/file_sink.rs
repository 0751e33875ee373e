// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Append-only JSON-lines audit file.
//!
//! Each line is the flat event record plus the `host` that wrote it. With an
//! integrity key configured, each line also carries `mac`:
//!
//! ```text
//! mac[n] = hex(HMAC-SHA256(key, mac[n-1] || body[n]))
//! ```
//!
//! where `body[n]` is the line without its `mac` field. Removing, reordering
//! or editing a line breaks every later mac; [`JsonlFileSink::verify`] walks
//! the chain. Writes take an exclusive `fs2` lock so several processes can
//! share one file.

use async_trait::async_trait;
use fs2::FileExt;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::SecurityEvent;
use crate::error::PortError;
use crate::ports::EventSink;
use crate::security::locks::resilient_lock;

type HmacSha256 = Hmac<Sha256>;

const MAC_FIELD: &str = "mac";

#[derive(Debug, Clone)]
pub struct JsonlFileSink {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    mac_key: Option<Vec<u8>>,
    last_mac: Mutex<String>,
    host: String,
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn compute_mac(key: &[u8], prev: &str, body: &str) -> String {
    // JUSTIFICATION for .expect(): HMAC is defined for keys of any length.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(prev.as_bytes());
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn last_mac_in(path: &Path) -> io::Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    let file = File::open(path)?;
    let mut last = String::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(&line) {
            if let Some(mac) = value.get(MAC_FIELD).and_then(Value::as_str) {
                last = mac.to_string();
            }
        }
    }
    Ok(last)
}

/// Result of walking the mac chain of an audit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    /// Every line verified.
    Intact { lines: usize },
    /// The line at this 1-based number is the first that fails.
    Broken { line: usize },
}

impl JsonlFileSink {
    /// Open (or create) the file at `path`. Parent directories are created.
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                mac_key: None,
                last_mac: Mutex::new(String::new()),
                host: local_hostname(),
            }),
        })
    }

    /// Open with an integrity key, continuing the chain already on disk.
    pub fn with_integrity_key(path: impl Into<PathBuf>, key: &[u8]) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let last = last_mac_in(&path)?;
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                mac_key: Some(key.to_vec()),
                last_mac: Mutex::new(last),
                host: local_hostname(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Walk the mac chain of the file at `path` under `key`.
    pub fn verify(path: &Path, key: &[u8]) -> io::Result<ChainStatus> {
        let file = File::open(path)?;
        let mut prev = String::new();
        let mut lines = 0;
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let broken = ChainStatus::Broken { line: index + 1 };
            let mut value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => return Ok(broken),
            };
            let claimed = match value.as_object_mut().and_then(|o| o.remove(MAC_FIELD)) {
                Some(Value::String(mac)) => mac,
                _ => return Ok(broken),
            };
            let body = value.to_string();
            let expected = compute_mac(key, &prev, &body);
            if !bool::from(expected.as_bytes().ct_eq(claimed.as_bytes())) {
                return Ok(broken);
            }
            prev = claimed;
            lines += 1;
        }
        Ok(ChainStatus::Intact { lines })
    }
}

impl Inner {
    fn append(&self, event: &SecurityEvent) -> Result<(), PortError> {
        let mut record = serde_json::to_value(event)
            .map_err(|e| PortError::Unavailable(format!("serialize: {}", e)))?;
        if let Some(obj) = record.as_object_mut() {
            obj.insert("host".to_string(), Value::String(self.host.clone()));
        }

        // Holding last_mac across the write keeps chain order equal to file
        // order within this process. The head only moves once the line is
        // on disk, so a failed write leaves the chain where it was.
        let mut last_mac = resilient_lock(&self.last_mac);
        let (line, next_mac) = match &self.mac_key {
            Some(key) => {
                let mac = compute_mac(key, &last_mac, &record.to_string());
                if let Some(obj) = record.as_object_mut() {
                    obj.insert(MAC_FIELD.to_string(), Value::String(mac.clone()));
                }
                (record.to_string(), Some(mac))
            }
            None => (record.to_string(), None),
        };

        let io_err = |e: io::Error| PortError::Unavailable(format!("audit file: {}", e));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        FileExt::lock_exclusive(&file).map_err(io_err)?;
        let written = writeln!(file, "{}", line).and_then(|_| file.flush());
        let unlocked = FileExt::unlock(&file);
        written.map_err(io_err)?;
        unlocked.map_err(io_err)?;

        if let Some(mac) = next_mac {
            *last_mac = mac;
        }
        Ok(())
    }
}

#[async_trait]
impl EventSink for JsonlFileSink {
    async fn persist(&self, event: &SecurityEvent) -> Result<(), PortError> {
        let inner = Arc::clone(&self.inner);
        let event = event.clone();
        tokio::task::spawn_blocking(move || inner.append(&event))
            .await
            .map_err(|e| PortError::Unavailable(format!("audit writer task: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{EventKind, Severity};
    use chrono::Utc;

    fn event(n: i64) -> SecurityEvent {
        SecurityEvent::new(EventKind::LoginFailure, Severity::Medium, "1.2.3.4", Utc::now())
            .actor("alice@x.com")
            .detail("failure_count", n)
    }

    #[tokio::test]
    async fn test_writes_one_flat_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlFileSink::new(dir.path().join("audit").join("events.jsonl")).unwrap();
        sink.persist(&event(1)).await.unwrap();
        sink.persist(&event(2)).await.unwrap();

        let content = fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<Value> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "login_failure");
        assert_eq!(lines[1]["details"]["failure_count"], 2);
        assert!(lines[0]["host"].is_string());
        assert!(lines[0].get(MAC_FIELD).is_none());
    }

    #[tokio::test]
    async fn test_chain_verifies_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let key = b"audit-integrity-key";

        let sink = JsonlFileSink::with_integrity_key(&path, key).unwrap();
        sink.persist(&event(1)).await.unwrap();
        sink.persist(&event(2)).await.unwrap();
        drop(sink);

        let reopened = JsonlFileSink::with_integrity_key(&path, key).unwrap();
        reopened.persist(&event(3)).await.unwrap();

        assert_eq!(JsonlFileSink::verify(&path, key).unwrap(), ChainStatus::Intact { lines: 3 });
    }

    #[tokio::test]
    async fn test_tampering_breaks_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let key = b"audit-integrity-key";

        let sink = JsonlFileSink::with_integrity_key(&path, key).unwrap();
        for n in 1..=3 {
            sink.persist(&event(n)).await.unwrap();
        }

        let content = fs::read_to_string(&path).unwrap();
        let tampered = content.replacen("alice@x.com", "mallory@x.com", 1);
        fs::write(&path, tampered).unwrap();
        assert_eq!(JsonlFileSink::verify(&path, key).unwrap(), ChainStatus::Broken { line: 1 });

        let dropped_middle: Vec<&str> = content.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
        fs::write(&path, dropped_middle.join("\n")).unwrap();
        assert_eq!(JsonlFileSink::verify(&path, key).unwrap(), ChainStatus::Broken { line: 2 });
    }

    #[tokio::test]
    async fn test_failed_write_does_not_advance_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let key = b"audit-integrity-key";

        let sink = JsonlFileSink::with_integrity_key(&path, key).unwrap();
        sink.persist(&event(1)).await.unwrap();

        // A directory at the file path makes the next append fail.
        let saved = fs::read_to_string(&path).unwrap();
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        assert!(matches!(sink.persist(&event(2)).await, Err(PortError::Unavailable(_))));

        fs::remove_dir(&path).unwrap();
        fs::write(&path, saved).unwrap();
        sink.persist(&event(3)).await.unwrap();

        assert_eq!(JsonlFileSink::verify(&path, key).unwrap(), ChainStatus::Intact { lines: 2 });
    }
}
