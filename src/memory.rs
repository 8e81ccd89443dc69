//! Durable conversation log: one append-only JSONL file per scope.
//!
//! Each line is a single record `{"value": "...", "timestamp": "...",
//! "user_name": "..."}`. Replay on open reproduces append order; malformed
//! lines are skipped so a torn write cannot poison the log.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub value: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// Append-only record log for one scope.
pub struct MemoryPool {
    file_path: PathBuf,
    records: Vec<MemoryRecord>,
}

impl MemoryPool {
    /// Open (or create) the log at `path` and replay its records.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file_path = path.as_ref().to_path_buf();
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {:?}", parent))?;
        }

        let mut records = Vec::new();
        if file_path.exists() {
            let file = File::open(&file_path)
                .with_context(|| format!("Failed to open memory log {:?}", file_path))?;
            for raw_line in BufReader::new(file).lines() {
                let line = raw_line
                    .with_context(|| format!("Failed to read memory log {:?}", file_path))?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<MemoryRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(_) => continue,
                }
            }
        } else {
            File::create(&file_path)
                .with_context(|| format!("Failed to create memory log {:?}", file_path))?;
        }

        Ok(Self { file_path, records })
    }

    /// Append one record, flushed to disk before returning. Blank values
    /// are ignored.
    pub fn append(&mut self, value: &str, user_name: Option<&str>) -> Result<()> {
        let item = value.trim();
        if item.is_empty() {
            return Ok(());
        }

        let record = MemoryRecord {
            value: item.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            user_name: user_name.map(|n| n.to_string()),
        };

        let line = serde_json::to_string(&record).context("Failed to serialize memory record")?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.file_path)
            .with_context(|| format!("Failed to open memory log {:?}", self.file_path))?;
        writeln!(file, "{}", line)
            .with_context(|| format!("Failed to append to memory log {:?}", self.file_path))?;
        file.flush()
            .with_context(|| format!("Failed to flush memory log {:?}", self.file_path))?;

        self.records.push(record);
        Ok(())
    }

    /// Last `limit` record values, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }
        let start = self.records.len().saturating_sub(limit);
        self.records[start..].iter().map(|r| r.value.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
