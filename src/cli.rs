//! Command-line interface

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::archive::DirectoryArchive;
use crate::auth::OAuthTokenProvider;
use crate::config::Config;
use crate::error::{Result, ScanError};
use crate::ledger::JsonLinesLedger;
use crate::llm::{build_llm, LlmClient};
use crate::orchestrator::{ScanOptions, ScanOrchestrator};
use crate::store::{Database, StoreStats};

#[derive(Parser, Debug)]
#[command(name = "inbox-ledger")]
#[command(version = "0.1.0")]
#[command(about = "Classify inbox mail, archive invoices and keep a ledger", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authorize a mailbox and register its user
    Auth {
        /// User the token is stored for
        #[arg(short, long, default_value = "default")]
        user: String,

        /// Force re-authentication even if token exists
        #[arg(long)]
        force: bool,
    },

    /// Process every unlabelled inbox message of a user
    Scan {
        #[arg(short, long)]
        user: String,
    },

    /// Show what has been recorded for a user
    Status {
        #[arg(short, long)]
        user: String,
    },

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

/// Progress reporter using indicatif
///
/// Everything is drawn on stderr so stdout stays machine-readable.
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap()
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        Self {
            multi,
            spinner_style,
        }
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Structured failure printed by `scan`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl From<&ScanError> for ErrorReport {
    fn from(error: &ScanError) -> Self {
        let message_id = match error {
            ScanError::MessageFailed { message_id, .. } => Some(message_id.clone()),
            _ => None,
        };
        Self {
            error: error.kind(),
            message: error.to_string(),
            message_id,
        }
    }
}

/// Per-user summary printed by `status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub user_id: String,
    pub email: Option<String>,
    #[serde(flatten)]
    pub stats: StoreStats,
}

/// Wire the production collaborators from configuration
pub async fn build_orchestrator(config: &Config) -> Result<ScanOrchestrator> {
    let store = Database::open(&config.database.path).await?;
    let auth = Arc::new(OAuthTokenProvider::new(
        &config.auth.credentials,
        &config.auth.token_dir,
        config.scan.max_concurrent_requests,
    ));
    let llm: Arc<dyn LlmClient> = Arc::from(build_llm(&config.classification)?);
    let archive = Arc::new(DirectoryArchive::new(
        &config.archive.root_dir,
        &config.archive.folder_name,
    ));
    let ledger = Arc::new(JsonLinesLedger::new(&config.ledger.dir));

    Ok(ScanOrchestrator::new(
        auth,
        llm,
        archive,
        ledger,
        store,
        ScanOptions::from_config(&config.scan),
    ))
}

pub async fn run_scan(
    config: &Config,
    user_id: &str,
    reporter: &ProgressReporter,
) -> Result<Vec<String>> {
    let orchestrator = build_orchestrator(config).await?;

    let spinner = reporter.add_spinner(&format!("Scanning mailbox of {}...", user_id));
    let result = orchestrator.scan(user_id).await;
    match &result {
        Ok(ids) => reporter.finish_spinner(&spinner, &format!("Recorded {} new messages", ids.len())),
        Err(_) => spinner.finish_and_clear(),
    }
    result
}

/// Run the consent flow for `user_id` and register the user
pub async fn run_auth(config: &Config, user_id: &str, force: bool) -> Result<String> {
    let provider = OAuthTokenProvider::new(
        &config.auth.credentials,
        &config.auth.token_dir,
        config.scan.max_concurrent_requests,
    );
    let address = provider.authorize_user(user_id, force).await?;

    let store = Database::open(&config.database.path).await?;
    store.upsert_user(user_id, Some(&address)).await?;
    info!("Registered user {} ({})", user_id, address);
    Ok(address)
}

pub async fn load_status(config: &Config, user_id: &str) -> Result<StatusReport> {
    let store = Database::open(&config.database.path).await?;
    status_from_store(&store, user_id).await
}

async fn status_from_store(store: &Database, user_id: &str) -> Result<StatusReport> {
    let user = store
        .get_user(user_id)
        .await?
        .ok_or_else(|| ScanError::UnknownUser(user_id.to_string()))?;
    let stats = store.stats(user_id).await?;
    Ok(StatusReport {
        user_id: user.id,
        email: user.email,
        stats,
    })
}
