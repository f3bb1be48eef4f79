//! Append-only audit log.
//!
//! One JSON object per line. Entries record a hash of the submitted code,
//! never the code itself. The begin entry for a request is written before
//! dispatch and the end entry after the outcome is known, so the file
//! order reflects the happens-before order of executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    Begin,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub action: String,
    pub phase: AuditPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    pub client_ip: String,
}

/// Append-only JSONL writer. Failures to write are logged and swallowed:
/// an audit outage must not take the service down with it.
pub struct AuditLog {
    file: Mutex<File>,
}

impl AuditLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn begin(&self, user_id: &str, action: &str, code_hash: Option<String>, client_ip: &str) {
        self.append(AuditEntry {
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            action: action.to_string(),
            phase: AuditPhase::Begin,
            code_hash,
            outcome: None,
            client_ip: client_ip.to_string(),
        });
    }

    pub fn end(&self, user_id: &str, action: &str, outcome: &str, client_ip: &str) {
        self.append(AuditEntry {
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            action: action.to_string(),
            phase: AuditPhase::End,
            code_hash: None,
            outcome: Some(outcome.to_string()),
            client_ip: client_ip.to_string(),
        });
    }

    fn append(&self, entry: AuditEntry) {
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!("audit entry serialization failed: {}", e);
                return;
            }
        };
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(file, "{}", line) {
            error!("audit write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_before_end_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();

        log.begin("alice", "exec", Some("abc123".to_string()), "127.0.0.1");
        log.end("alice", "exec", "success", "127.0.0.1");

        let content = std::fs::read_to_string(&path).unwrap();
        let entries: Vec<AuditEntry> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].phase, AuditPhase::Begin);
        assert_eq!(entries[0].code_hash.as_deref(), Some("abc123"));
        assert_eq!(entries[1].phase, AuditPhase::End);
        assert_eq!(entries[1].outcome.as_deref(), Some("success"));
        assert!(entries[1].timestamp >= entries[0].timestamp);
    }

    #[test]
    fn test_rejected_requests_still_logged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();

        log.end("bob", "exec", "rate_limited", "10.0.0.9");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("rate_limited"));
        assert!(content.contains("bob"));
    }
}
