//! Security audit trail.
//!
//! The orchestrator reports every security-relevant transition to an
//! [`AuditSink`]. Sinks are fire-and-forget: the caller logs and discards
//! any error they return.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const MAX_ROTATIONS: usize = 5;
const CHAIN_START: &str = "CHAIN_START";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEvent {
    VaultSetup,
    UnlockSuccess,
    UnlockFailed,
    UnlockRateLimited,
    DeviceKeyMissing,
    RecoveryKeyFailed,
    RecoveryUnlockFailed,
    RecoveryUnlockSuccess,
    Lock,
    PasswordChanged,
    PasswordChangeFailed,
    LockTimeoutChanged,
    ConfigReplaced,
}

impl SecurityEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VaultSetup => "vault_setup",
            Self::UnlockSuccess => "unlock_success",
            Self::UnlockFailed => "unlock_failed",
            Self::UnlockRateLimited => "unlock_rate_limited",
            Self::DeviceKeyMissing => "device_key_missing",
            Self::RecoveryKeyFailed => "recovery_key_failed",
            Self::RecoveryUnlockFailed => "recovery_unlock_failed",
            Self::RecoveryUnlockSuccess => "recovery_unlock_success",
            Self::Lock => "lock",
            Self::PasswordChanged => "password_changed",
            Self::PasswordChangeFailed => "password_change_failed",
            Self::LockTimeoutChanged => "lock_timeout_changed",
            Self::ConfigReplaced => "config_replaced",
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            Self::UnlockFailed
            | Self::RecoveryKeyFailed
            | Self::RecoveryUnlockFailed
            | Self::PasswordChangeFailed => EventSeverity::Warn,
            Self::UnlockRateLimited | Self::DeviceKeyMissing | Self::ConfigReplaced => {
                EventSeverity::Critical
            }
            _ => EventSeverity::Info,
        }
    }
}

impl std::fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Info,
    Warn,
    Critical,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: SecurityEvent, detail: serde_json::Value) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: SecurityEvent, _detail: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Keeps events in memory, oldest first.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<(SecurityEvent, serde_json::Value)>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().iter().map(|(e, _)| *e).collect()
    }

    pub fn entries(&self) -> Vec<(SecurityEvent, serde_json::Value)> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: SecurityEvent) -> usize {
        self.events.lock().iter().filter(|(e, _)| *e == event).count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: SecurityEvent, detail: serde_json::Value) -> Result<()> {
        self.events.lock().push((event, detail));
        Ok(())
    }
}

// ── JSON-lines file ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: EventSeverity,
    pub data: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug)]
struct LogState {
    last_seq: u64,
    last_hash: String,
}

/// Append-only, hash-chained JSONL file with size-based rotation.
pub struct JsonlAuditLog {
    path: PathBuf,
    inner: Mutex<LogState>,
    max_bytes: u64,
}

impl JsonlAuditLog {
    pub fn open<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(LogState {
                last_seq,
                last_hash,
            }),
            max_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_state(path: &Path) -> Result<(u64, String)> {
        if !path.exists() {
            return Ok((0, CHAIN_START.to_string()));
        }
        let reader = BufReader::new(File::open(path)?);
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => {
                    last_seq = entry.seq;
                    last_hash = entry.hash;
                }
                Err(e) => {
                    // torn append; later entries start a fresh chain
                    warn!(path = %path.display(), error = %e, "skipping unreadable audit line");
                    last_hash = CHAIN_START.to_string();
                }
            }
        }
        Ok((last_seq, last_hash))
    }

    fn compute_hash(unsealed: &serde_json::Value) -> String {
        hex::encode(Sha256::digest(unsealed.to_string().as_bytes()))
    }

    pub fn append(&self, event: SecurityEvent, data: serde_json::Value) -> Result<AuditEntry> {
        let mut state = self.inner.lock();
        self.rotate_if_needed(&mut state)?;
        let seq = state.last_seq + 1;
        let mut value = serde_json::json!({
            "seq": seq,
            "timestamp": Utc::now(),
            "event_type": event.as_str(),
            "severity": event.severity(),
            "data": data,
            "prev_hash": state.last_hash,
        });
        let hash = Self::compute_hash(&value);
        value["hash"] = serde_json::Value::String(hash.clone());
        let entry: AuditEntry = serde_json::from_value(value)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        file.flush()?;

        state.last_seq = seq;
        state.last_hash = hash;
        Ok(entry)
    }

    fn rotate_if_needed(&self, state: &mut LogState) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..=MAX_ROTATIONS).rev() {
            let rotated = self.path_with_suffix(i)?;
            if rotated.exists() {
                if i == MAX_ROTATIONS {
                    fs::remove_file(&rotated)?;
                } else {
                    fs::rename(&rotated, self.path_with_suffix(i + 1)?)?;
                }
            }
        }
        fs::rename(&self.path, self.path_with_suffix(1)?)?;
        // new file, new chain; seq stays monotonic
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    /// Parsed lines, oldest first. `None` marks a line that is not an entry.
    fn read_lines(&self) -> Result<Vec<Option<AuditEntry>>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            lines.push(serde_json::from_str::<AuditEntry>(&line).ok());
        }
        Ok(lines)
    }

    /// Most recent first. Unreadable lines are skipped.
    pub fn read_recent(&self, limit: Option<usize>) -> Result<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> = self.read_lines()?.into_iter().flatten().collect();
        entries.reverse();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Recompute every hash in the live file and check the links. An
    /// unreadable line counts as a break.
    pub fn verify_chain(&self) -> Result<usize> {
        let mut entries = Vec::new();
        for (index, line) in self.read_lines()?.into_iter().enumerate() {
            entries.push(line.ok_or_else(|| anyhow!("unreadable audit line {}", index + 1))?);
        }
        let mut prev = CHAIN_START.to_string();
        for entry in &entries {
            if entry.prev_hash != prev {
                return Err(anyhow!("audit chain broken at seq {}", entry.seq));
            }
            let unsealed = serde_json::json!({
                "seq": entry.seq,
                "timestamp": entry.timestamp,
                "event_type": entry.event_type,
                "severity": entry.severity,
                "data": entry.data,
                "prev_hash": entry.prev_hash,
            });
            if Self::compute_hash(&unsealed) != entry.hash {
                return Err(anyhow!("audit entry {} has been altered", entry.seq));
            }
            prev = entry.hash.clone();
        }
        Ok(entries.len())
    }

    fn path_with_suffix(&self, index: usize) -> Result<PathBuf> {
        let filename = self
            .path
            .file_name()
            .ok_or_else(|| anyhow!("audit log path has no file name"))?
            .to_string_lossy()
            .to_string();
        Ok(self.path.with_file_name(format!("{filename}.{index}")))
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, event: SecurityEvent, detail: serde_json::Value) -> Result<()> {
        self.append(event, detail).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn chain_links_and_verifies() {
        let dir = tempdir().unwrap();
        let log = JsonlAuditLog::open(dir.path().join("audit.log"), 1 << 20).unwrap();
        let first = log
            .append(SecurityEvent::VaultSetup, serde_json::json!({"deviceKeyEnabled": true}))
            .unwrap();
        let second = log
            .append(SecurityEvent::UnlockFailed, serde_json::json!({}))
            .unwrap();
        assert_eq!(first.prev_hash, CHAIN_START);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(second.event_type, "unlock_failed");
        assert_eq!(second.severity, EventSeverity::Warn);
        assert_eq!(log.verify_chain().unwrap(), 2);
    }

    #[test]
    fn state_resumes_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let last = {
            let log = JsonlAuditLog::open(&path, 1 << 20).unwrap();
            log.append(SecurityEvent::Lock, serde_json::json!({})).unwrap();
            log.append(SecurityEvent::Lock, serde_json::json!({})).unwrap()
        };
        let log = JsonlAuditLog::open(&path, 1 << 20).unwrap();
        let next = log
            .append(SecurityEvent::UnlockSuccess, serde_json::json!({}))
            .unwrap();
        assert_eq!(next.seq, 3);
        assert_eq!(next.prev_hash, last.hash);
    }

    #[test]
    fn tampering_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = JsonlAuditLog::open(&path, 1 << 20).unwrap();
        log.append(SecurityEvent::UnlockFailed, serde_json::json!({"n": 1}))
            .unwrap();
        log.append(SecurityEvent::UnlockSuccess, serde_json::json!({}))
            .unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.replace("\"n\":1", "\"n\":2")).unwrap();
        assert!(log.verify_chain().is_err());
    }

    #[test]
    fn rotation_keeps_sequence_monotonic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = JsonlAuditLog::open(&path, 512).unwrap();
        for i in 0..50 {
            let entry = log
                .append(SecurityEvent::UnlockFailed, serde_json::json!({ "i": i }))
                .unwrap();
            assert_eq!(entry.seq as usize, i + 1);
        }
        assert!(path.with_file_name("audit.log.1").exists());
        assert!(!path.with_file_name("audit.log.6").exists());
        log.verify_chain().unwrap();
    }

    #[test]
    fn torn_line_is_skipped_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        {
            let log = JsonlAuditLog::open(&path, 1 << 20).unwrap();
            log.append(SecurityEvent::Lock, serde_json::json!({})).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":2,\"timest").unwrap();
        file.write_all(b"\n").unwrap();
        drop(file);

        let log = JsonlAuditLog::open(&path, 1 << 20).unwrap();
        let next = log
            .append(SecurityEvent::UnlockSuccess, serde_json::json!({}))
            .unwrap();
        assert_eq!(next.seq, 2);
        assert_eq!(next.prev_hash, CHAIN_START);
        let recent = log.read_recent(None).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event_type, "unlock_success");
        assert!(log.verify_chain().is_err());
    }

    #[test]
    fn read_recent_is_newest_first() {
        let dir = tempdir().unwrap();
        let log = JsonlAuditLog::open(dir.path().join("audit.log"), 1 << 20).unwrap();
        log.record(SecurityEvent::VaultSetup, serde_json::json!({}))
            .unwrap();
        log.record(SecurityEvent::Lock, serde_json::json!({})).unwrap();
        let recent = log.read_recent(Some(1)).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_type, "lock");
    }

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemoryAuditSink::new();
        sink.record(SecurityEvent::UnlockFailed, serde_json::json!({}))
            .unwrap();
        sink.record(SecurityEvent::UnlockSuccess, serde_json::json!({}))
            .unwrap();
        assert_eq!(
            sink.events(),
            vec![SecurityEvent::UnlockFailed, SecurityEvent::UnlockSuccess]
        );
        assert_eq!(sink.count(SecurityEvent::UnlockFailed), 1);
    }

    #[test]
    fn event_names_match_serde() {
        for event in [
            SecurityEvent::RecoveryUnlockSuccess,
            SecurityEvent::UnlockRateLimited,
            SecurityEvent::LockTimeoutChanged,
        ] {
            let json = serde_json::to_value(event).unwrap();
            assert_eq!(json, serde_json::json!(event.as_str()));
        }
    }
}
