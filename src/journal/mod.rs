//! Append-only JSONL journal of task lifecycle events.
//!
//! One line per event, written as it happens. The journal is diagnostics
//! and audit data, not authoritative state: the in-memory task table owns
//! the truth. `record` takes only the journal's own file lock and never
//! calls back into the scheduler, so callers may hold the table lock.

use crate::error::{Result, StagehandError};
use crate::id::now_ms;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const EVENT_SUBMITTED: &str = "submitted";
pub const EVENT_QUEUED: &str = "queued";
pub const EVENT_STARTED: &str = "started";
pub const EVENT_STAGE: &str = "stage";
pub const EVENT_RETRY_SCHEDULED: &str = "retry_scheduled";
pub const EVENT_COMPLETED: &str = "completed";
pub const EVENT_FAILED: &str = "failed";
pub const EVENT_CANCELLED: &str = "cancelled";
pub const EVENT_PRIORITY_CHANGED: &str = "priority_changed";
pub const EVENT_DEPENDENCY_ADDED: &str = "dependency_added";

/// One journalled lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,

    pub task_id: String,

    /// One of the EVENT_* names
    pub event: String,

    /// Event-specific payload
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// Append-only journal backed by a single JSONL file.
pub struct TaskJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl TaskJournal {
    /// Open or create `events.jsonl` under the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("events.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event.
    pub fn record(&self, task_id: &str, event: &str, detail: serde_json::Value) -> Result<()> {
        let entry = JournalEntry {
            timestamp: now_ms(),
            task_id: task_id.to_string(),
            event: event.to_string(),
            detail,
        };
        let line = serde_json::to_string(&entry)?;
        let mut file = self
            .file
            .lock()
            .map_err(|e| StagehandError::Journal(e.to_string()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Read every event back, oldest first.
    pub fn read_all(&self) -> Result<Vec<JournalEntry>> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Read the events for one task, oldest first.
    pub fn read_task(&self, task_id: &str) -> Result<Vec<JournalEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.task_id == task_id)
            .collect())
    }
}
