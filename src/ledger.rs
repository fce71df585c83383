//! Append-only ledger of archived files

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, ScanError};
use crate::models::LedgerEntry;

/// Spreadsheet-like sink with one row per archived file
#[async_trait]
pub trait LedgerSink: Send + Sync {
    /// Append one row per entry; returns row ids in input order
    async fn log_files(&self, user_id: &str, entries: &[LedgerEntry]) -> Result<Vec<String>>;
}

#[derive(Serialize)]
struct LedgerLine<'a> {
    sender: &'a str,
    subject: &'a str,
    date: String,
    invoice_number: &'a str,
    file_id: &'a str,
}

/// Ledger stored as `{dir}/{user}.jsonl`; row `n` is line `n`
pub struct JsonLinesLedger {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        let name: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.jsonl", name))
    }
}

fn logging_error(e: impl std::fmt::Display) -> ScanError {
    ScanError::LoggingError(e.to_string())
}

#[async_trait]
impl LedgerSink for JsonLinesLedger {
    async fn log_files(&self, user_id: &str, entries: &[LedgerEntry]) -> Result<Vec<String>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await.map_err(logging_error)?;

        let path = self.path_for(user_id);
        let existing_rows = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content.lines().filter(|l| !l.trim().is_empty()).count(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(logging_error(e)),
        };

        let mut buffer = String::new();
        let mut row_ids = Vec::with_capacity(entries.len());
        for (offset, entry) in entries.iter().enumerate() {
            let line = LedgerLine {
                sender: &entry.sender,
                subject: &entry.subject,
                date: entry.date.to_rfc3339(),
                invoice_number: entry.invoice_number.as_deref().unwrap_or(""),
                file_id: &entry.file_id,
            };
            buffer.push_str(&serde_json::to_string(&line).map_err(logging_error)?);
            buffer.push('\n');
            row_ids.push(format!("row_{}", existing_rows + offset + 1));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(logging_error)?;
        file.write_all(buffer.as_bytes()).await.map_err(logging_error)?;
        file.flush().await.map_err(logging_error)?;

        debug!("Logged {} ledger rows to {}", row_ids.len(), path.display());
        Ok(row_ids)
    }
}
