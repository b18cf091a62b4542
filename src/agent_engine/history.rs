use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DeskResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: DateTime<Utc>,
    pub session_id: String,
    pub step: u64,
    pub summary: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// Append-only JSONL log of dispatched actions (`actions.log`).
pub struct ActionLog {
    pub session_id: String,
    file_path: PathBuf,
}

impl ActionLog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            file_path: data_dir.join("actions.log"),
        }
    }

    pub fn append(&self, step: u64, summary: &str, meta: serde_json::Value) -> DeskResult<()> {
        let entry = HistoryEntry {
            ts: Utc::now(),
            session_id: self.session_id.clone(),
            step,
            summary: summary.to_string(),
            meta,
        };
        let line = serde_json::to_string(&entry)?;
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        writeln!(file, "{}", line)?;
        tracing::debug!(path = %self.file_path.display(), step, "action logged");
        Ok(())
    }

    /// The last `limit` entries, oldest first. Unparseable lines are skipped.
    pub fn tail(&self, limit: usize) -> DeskResult<Vec<HistoryEntry>> {
        let content = match std::fs::read_to_string(&self.file_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<HistoryEntry> = content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_and_tails() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ActionLog::new(tmp.path());
        assert!(log.tail(5).unwrap().is_empty());
        for i in 1..=4 {
            log.append(i, &format!("CLICK #{i}"), serde_json::json!({"i": i})).unwrap();
        }
        let tail = log.tail(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].summary, "CLICK #3");
        assert_eq!(tail[1].step, 4);
        assert_eq!(tail[1].session_id, log.session_id);
    }
}
