//! Inbox Ledger
//!
//! Scans a Gmail inbox for messages that carry none of the pipeline's labels,
//! classifies them with a language model, archives the attachments of
//! financial mail, logs one ledger row per archived file and labels every
//! processed message so the next scan skips it.
//!
//! # Overview
//!
//! - **Authentication**: per-user OAuth2 token files, refreshed without prompting
//! - **Fetching**: paginated listing that excludes already-labelled mail
//! - **Normalization**: reply-prefix stripping and synthetic thread subjects
//! - **Classification**: one batched model call with a safe fallback
//! - **Archival**: structured file names and a JSON-lines ledger
//! - **Persistence**: one SQLite transaction per processed message
//!
//! # Example Usage
//!
//! ```no_run
//! use inbox_ledger::{cli, config::Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let orchestrator = cli::build_orchestrator(&config).await?;
//!
//!     let created = orchestrator.scan("default").await?;
//!     println!("{} new records", created.len());
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - OAuth2 token handling and the authenticated mailbox factory
//! - [`mailbox`] - Rate-limited Gmail API access with retry logic
//! - [`fetcher`] - Listing of unprocessed inbox messages
//! - [`thread_index`] - Reply positions within threads
//! - [`normalizer`] - Subject and sender normalization
//! - [`classifier`] / [`llm`] - Batch classification
//! - [`attachments`] - Attachment download for financial mail
//! - [`archive`] / [`ledger`] - File archive and ledger collaborators
//! - [`labels`] - Label creation and application
//! - [`store`] - Relational record of processed messages
//! - [`orchestrator`] - The scan pipeline
//! - [`cli`] - Command-line wiring
//! - [`config`] - Configuration management
//! - [`error`] - Error types and result aliases

pub mod archive;
pub mod attachments;
pub mod auth;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod labels;
pub mod ledger;
pub mod llm;
pub mod mailbox;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod store;
pub mod thread_index;

// Re-export commonly used types for convenience
pub use error::{AuthFailure, Result, ScanError};

// Core data models
pub use models::{
    ArchivedFile, EmailCategory, EmailClassification, EmailMeta, NonFinancialKind,
    ProcessedEmailRecord, RawMessage,
};

// Collaborator seams
pub use archive::ArchiveStore;
pub use auth::AuthProvider;
pub use ledger::LedgerSink;
pub use llm::LlmClient;
pub use mailbox::MailProvider;

// Pipeline
pub use config::Config;
pub use orchestrator::{ScanOptions, ScanOrchestrator, ScanPhase};
pub use store::Database;
