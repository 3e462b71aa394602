//! Append-only structured record of PDP decisions and tool invocations.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write as _};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::pdp::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditDecision {
    Allow,
    Deny,
}

impl From<&Decision> for AuditDecision {
    fn from(value: &Decision) -> Self {
        match value {
            Decision::Allow => AuditDecision::Allow,
            Decision::Deny(_) => AuditDecision::Deny,
        }
    }
}

/// `{timestamp, envelope_id, user_id, channel, decision, subject, reason,
/// metadata}`. Append-only; never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub envelope_id: Uuid,
    pub user_id: String,
    pub channel: String,
    pub decision: AuditDecision,
    pub subject: String,
    pub reason: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AuditRecord {
    pub fn new(
        envelope_id: Uuid,
        user_id: impl Into<String>,
        channel: impl Into<String>,
        decision: &Decision,
        subject: impl Into<String>,
    ) -> Self {
        let reason = match decision {
            Decision::Allow => "allowed".to_string(),
            Decision::Deny(reason) => reason.clone(),
        };
        Self {
            timestamp: Utc::now(),
            envelope_id,
            user_id: user_id.into(),
            channel: channel.into(),
            decision: AuditDecision::from(decision),
            subject: subject.into(),
            reason,
            metadata: HashMap::new(),
        }
    }
}

/// Pluggable append-only sink. The core ships a newline-delimited
/// structured file implementation; a database-backed sink can implement
/// this trait without touching the PDP.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> anyhow::Result<()>;
    fn last_n(&self, n: usize) -> Vec<AuditRecord>;
    fn last_n_denied(&self, n: usize) -> Vec<AuditRecord>;
    fn for_user(&self, user_id: &str) -> Vec<AuditRecord>;
}

/// File-backed JSONL audit sink. Writes are serialized with an internal
/// mutex (the PDP fires far below disk-write throughput, so this is not a
/// contention hazard) and fsynced so an audit record survives a crash
/// immediately after the decision it documents.
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    /// Loads every record currently on disk, tolerating corrupt lines the
    /// same way the audit log's append path tolerates write races: a
    /// corrupt line is logged and skipped, not fatal to the read.
    pub fn load(&self) -> Vec<AuditRecord> {
        let Ok(file) = std::fs::OpenOptions::new().read(true).open(&self.path) else {
            return Vec::new();
        };
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for (line_idx, line_result) in reader.lines().enumerate() {
            let Ok(line) = line_result else { continue };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(line = line_idx + 1, error = %err, path = %self.path.display(), "corrupt audit record — skipping line");
                    let corrupt_path = self.path.with_extension("jsonl.corrupt");
                    if let Ok(mut bad) = std::fs::OpenOptions::new().create(true).append(true).open(&corrupt_path) {
                        let _ = writeln!(bad, "{line}");
                    }
                }
            }
        }
        records
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, record: AuditRecord) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().expect("audit sink mutex poisoned");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        let line = serde_json::to_string(&record)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    fn last_n(&self, n: usize) -> Vec<AuditRecord> {
        let mut records = self.load();
        let start = records.len().saturating_sub(n);
        records.split_off(start)
    }

    fn last_n_denied(&self, n: usize) -> Vec<AuditRecord> {
        let denied: Vec<AuditRecord> = self
            .load()
            .into_iter()
            .filter(|r| r.decision == AuditDecision::Deny)
            .collect();
        let start = denied.len().saturating_sub(n);
        denied[start..].to_vec()
    }

    fn for_user(&self, user_id: &str) -> Vec<AuditRecord> {
        self.load().into_iter().filter(|r| r.user_id == user_id).collect()
    }
}
