//! Durable record of processed messages
//!
//! A thread-safe wrapper around rusqlite. Every call runs on `spawn_blocking`
//! and one message's writes always commit or roll back together.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::models::ProcessedEmailRecord;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        email TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS processed_emails (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        gmail_message_id TEXT NOT NULL UNIQUE,
        thread_id TEXT NOT NULL,
        sender TEXT NOT NULL,
        subject TEXT NOT NULL,
        body_snippet TEXT NOT NULL,
        date_received TEXT NOT NULL,
        label TEXT NOT NULL,
        remote_label TEXT,
        processed_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_processed_emails_user ON processed_emails(user_id);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS email_classifications (
        email_id TEXT PRIMARY KEY REFERENCES processed_emails(id) ON DELETE CASCADE,
        category TEXT NOT NULL,
        is_financial INTEGER NOT NULL,
        confidence REAL NOT NULL,
        classified_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS archived_files (
        id TEXT PRIMARY KEY,
        email_id TEXT NOT NULL REFERENCES processed_emails(id) ON DELETE CASCADE,
        file_id TEXT NOT NULL,
        file_name TEXT NOT NULL,
        file_url TEXT NOT NULL,
        folder TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_rows (
        id TEXT PRIMARY KEY,
        email_id TEXT NOT NULL REFERENCES processed_emails(id) ON DELETE CASCADE,
        archived_file_id TEXT NOT NULL REFERENCES archived_files(id) ON DELETE CASCADE,
        ledger_row_id TEXT NOT NULL,
        record_date TEXT NOT NULL
    );
    "#,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub email: Option<String>,
}

/// Stored message as seen by later scans
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRef {
    pub record_id: String,
    pub label: String,
    pub remote_label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub records: u64,
    pub financial: u64,
    pub archived_files: u64,
    pub ledger_rows: u64,
    /// Records whose label never reached the mailbox
    pub unlabeled: u64,
}

fn join_error(e: tokio::task::JoinError) -> ScanError {
    ScanError::PersistenceError(format!("database task failed: {}", e))
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// Thread-safe database connection wrapper.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            Ok(conn)
        })
        .await
        .map_err(join_error)??;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Opens an in-memory database for testing.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(conn)
        })
        .await
        .map_err(join_error)??;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        self.with_conn(|conn| {
            for migration in SCHEMA {
                conn.execute_batch(migration)?;
            }
            Ok(())
        })
        .await
    }

    /// Executes a function with access to the database connection.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(join_error)?
    }

    /// Executes a transaction with the given function.
    ///
    /// The transaction is committed on success and rolled back on error.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
        .await
        .map_err(join_error)?
    }

    /// Register a user, or refresh their address when one is given
    pub async fn upsert_user(&self, user_id: &str, email: Option<&str>) -> Result<()> {
        let user_id = user_id.to_string();
        let email = email.map(str::to_string);
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO users (id, email, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    email = COALESCE(excluded.email, users.email),
                    updated_at = excluded.updated_at",
                params![user_id, email, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let user = conn
                .query_row(
                    "SELECT id, email FROM users WHERE id = ?1",
                    params![user_id],
                    |row| {
                        Ok(UserRecord {
                            id: row.get(0)?,
                            email: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    /// Stored record for a mailbox message id, if any
    pub async fn find_processed(&self, gmail_message_id: &str) -> Result<Option<ProcessedRef>> {
        let message_id = gmail_message_id.to_string();
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    "SELECT id, label, remote_label FROM processed_emails WHERE gmail_message_id = ?1",
                    params![message_id],
                    |row| {
                        Ok(ProcessedRef {
                            record_id: row.get(0)?,
                            label: row.get(1)?,
                            remote_label: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(found)
        })
        .await
    }

    /// Write a message's record, classification, files and ledger rows as one unit
    ///
    /// Returns the new record id. A message id that is already stored yields
    /// [`ScanError::DuplicateMessage`] and writes nothing.
    pub async fn record_outcome(&self, record: &ProcessedEmailRecord) -> Result<String> {
        let record = record.clone();
        self.transaction(move |tx| {
            let record_id = Uuid::new_v4().to_string();
            let now = Utc::now().to_rfc3339();
            let email = &record.email;

            tx.execute(
                "INSERT INTO processed_emails
                    (id, user_id, gmail_message_id, thread_id, sender, subject, body_snippet,
                     date_received, label, remote_label, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10)",
                params![
                    record_id,
                    record.user_id,
                    email.id,
                    email.thread_id,
                    email.sender,
                    email.subject,
                    email.snippet,
                    email.date.to_rfc3339(),
                    record.label(),
                    now,
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ScanError::DuplicateMessage(email.id.clone())
                } else {
                    ScanError::from(e)
                }
            })?;

            let category = record.classification.category;
            tx.execute(
                "INSERT INTO email_classifications
                    (email_id, category, is_financial, confidence, classified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record_id,
                    category.wire_name(),
                    category.is_financial(),
                    f64::from(record.classification.confidence()),
                    now,
                ],
            )?;

            for file in &record.files {
                let archived_id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO archived_files
                        (id, email_id, file_id, file_name, file_url, folder, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        archived_id,
                        record_id,
                        file.file_id,
                        file.file_name,
                        file.file_url,
                        file.folder,
                        now,
                    ],
                )?;
                tx.execute(
                    "INSERT INTO ledger_rows (id, email_id, archived_file_id, ledger_row_id, record_date)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        Uuid::new_v4().to_string(),
                        record_id,
                        archived_id,
                        file.ledger_row_id,
                        now,
                    ],
                )?;
            }

            debug!(
                "Recorded message {} as {} with {} files",
                email.id,
                record_id,
                record.files.len()
            );
            Ok(record_id)
        })
        .await
    }

    /// Note the label that was applied on the mailbox
    pub async fn attach_remote_label(&self, record_id: &str, label: &str) -> Result<()> {
        let record_id = record_id.to_string();
        let label = label.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE processed_emails SET remote_label = ?1 WHERE id = ?2",
                params![label, record_id],
            )?;
            if updated == 0 {
                return Err(ScanError::PersistenceError(format!(
                    "no processed email with id {}",
                    record_id
                )));
            }
            Ok(())
        })
        .await
    }

    pub async fn stats(&self, user_id: &str) -> Result<StoreStats> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let count = |sql: &str| -> Result<u64> {
                let n: i64 = conn.query_row(sql, params![user_id], |row| row.get(0))?;
                Ok(n as u64)
            };
            Ok(StoreStats {
                records: count("SELECT COUNT(*) FROM processed_emails WHERE user_id = ?1")?,
                financial: count(
                    "SELECT COUNT(*) FROM email_classifications c
                     JOIN processed_emails e ON e.id = c.email_id
                     WHERE e.user_id = ?1 AND c.is_financial = 1",
                )?,
                archived_files: count(
                    "SELECT COUNT(*) FROM archived_files f
                     JOIN processed_emails e ON e.id = f.email_id WHERE e.user_id = ?1",
                )?,
                ledger_rows: count(
                    "SELECT COUNT(*) FROM ledger_rows r
                     JOIN processed_emails e ON e.id = r.email_id WHERE e.user_id = ?1",
                )?,
                unlabeled: count(
                    "SELECT COUNT(*) FROM processed_emails WHERE user_id = ?1 AND remote_label IS NULL",
                )?,
            })
        })
        .await
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
