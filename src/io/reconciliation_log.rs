//! Reconciliation log - writes that exhausted their retries
//!
//! Records are written in JSONL format (one JSON object per line) so an
//! operator can replay or fix them by hand once the backend is reachable.

use crate::services::sync_gateway::ReconciliationRecord;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

pub struct ReconciliationLog {
    file_path: String,
}

impl ReconciliationLog {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "reconciliation_log_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Append a record. Returns true if successful.
    pub fn write_record(&self, record: &ReconciliationRecord) -> bool {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                error!(key = %record.key, error = %e, "reconciliation_serialize_failed");
                return false;
            }
        };

        match self.append_line(&json) {
            Ok(()) => true,
            Err(e) => {
                error!(key = %record.key, error = %e, "reconciliation_write_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "reconciliation_written");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use tempfile::tempdir;

    fn record(key: &str) -> ReconciliationRecord {
        ReconciliationRecord {
            kind: "attendance".to_string(),
            key: key.to_string(),
            attempts: 5,
            last_error: "HTTP error: connection refused".to_string(),
            failed_at: Utc::now(),
            payload: serde_json::json!({"student_id": "s1", "outcome": "auto_present"}),
        }
    }

    #[test]
    fn test_creates_parent_directories_and_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("reconcile.jsonl");
        let log = ReconciliationLog::new(path.to_str().unwrap());

        assert!(log.write_record(&record("exec-1:s1")));
        assert!(log.write_record(&record("exec-1:s2")));

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed["key"], "exec-1:s2");
        assert_eq!(parsed["payload"]["outcome"], "auto_present");
    }
}
