//! Scan pipeline: fetch, index, classify, then archive, persist and label
//! each message in fetch order.

use futures::stream::{self, StreamExt, TryStreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::archive::{structured_name, ArchiveStore};
use crate::attachments::AttachmentCollector;
use crate::auth::AuthProvider;
use crate::classifier::Classifier;
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::fetcher::{FetchOptions, UnprocessedMessageFetcher};
use crate::labels::LabelApplier;
use crate::ledger::LedgerSink;
use crate::llm::LlmClient;
use crate::mailbox::{message_date, MailProvider};
use crate::models::{
    ArchiveUpload, ArchivedFile, Attachment, ClassificationRequest, EmailClassification,
    EmailMeta, LedgerEntry, ProcessedEmailRecord, RawMessage,
};
use crate::normalizer::{normalize_sender, normalize_subject};
use crate::store::{Database, ProcessedRef};
use crate::thread_index::ThreadPositionIndexer;

static INVOICE_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:INV|Invoice|Bill|Receipt|#)?[-_ ]?\d{4,}").unwrap());

/// First invoice-number-looking token in a subject
pub fn invoice_hint(subject: &str) -> Option<String> {
    INVOICE_HINT
        .find(subject)
        .map(|m| m.as_str().trim().to_string())
        .filter(|hint| !hint.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Authenticating,
    Fetching,
    Indexing,
    Classifying,
    Extracting,
    Archiving,
    Persisting,
    Labeling,
    Done,
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanPhase::Authenticating => "authenticating",
            ScanPhase::Fetching => "fetching",
            ScanPhase::Indexing => "indexing",
            ScanPhase::Classifying => "classifying",
            ScanPhase::Extracting => "extracting",
            ScanPhase::Archiving => "archiving",
            ScanPhase::Persisting => "persisting",
            ScanPhase::Labeling => "labeling",
            ScanPhase::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub fetch: FetchOptions,
    /// Full-message downloads in flight during indexing
    pub prefetch_concurrency: usize,
    pub thread_cache_capacity: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::from_config(&ScanConfig::default())
    }
}

impl ScanOptions {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            fetch: FetchOptions {
                newer_than_days: config.newer_than_days,
                page_size: config.page_size,
            },
            prefetch_concurrency: config.max_concurrent_requests.max(1),
            thread_cache_capacity: config.thread_cache_capacity,
        }
    }
}

/// A fetched message ready for the per-message loop
enum Prepared {
    /// Recorded by an earlier invocation; only its label is re-applied
    Recorded { message_id: String, existing: ProcessedRef },
    Fresh { raw: RawMessage, meta: EmailMeta },
}

pub struct ScanOrchestrator {
    auth: Arc<dyn AuthProvider>,
    classifier: Classifier,
    archive: Arc<dyn ArchiveStore>,
    ledger: Arc<dyn LedgerSink>,
    store: Database,
    options: ScanOptions,
}

impl ScanOrchestrator {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        llm: Arc<dyn LlmClient>,
        archive: Arc<dyn ArchiveStore>,
        ledger: Arc<dyn LedgerSink>,
        store: Database,
        options: ScanOptions,
    ) -> Self {
        Self {
            auth,
            classifier: Classifier::new(llm),
            archive,
            ledger,
            store,
            options,
        }
    }

    fn enter(user_id: &str, phase: ScanPhase) {
        info!("[{}] {}", user_id, phase);
    }

    fn enter_message(user_id: &str, message_id: &str, phase: ScanPhase) {
        debug!("[{}] {} {}", user_id, message_id, phase);
    }

    /// Process every unlabelled inbox message of `user_id`
    ///
    /// Returns the ids of the records created by this invocation, in fetch
    /// order. The first failing message aborts the invocation; messages
    /// committed before it stay committed.
    pub async fn scan(&self, user_id: &str) -> Result<Vec<String>> {
        Self::enter(user_id, ScanPhase::Authenticating);
        let mailbox = self.connect(user_id).await?;
        self.store.upsert_user(user_id, None).await?;

        Self::enter(user_id, ScanPhase::Fetching);
        let ids = UnprocessedMessageFetcher::new(mailbox.as_ref(), self.options.fetch)
            .fetch()
            .await?;
        if ids.is_empty() {
            info!("[{}] No unprocessed messages", user_id);
            Self::enter(user_id, ScanPhase::Done);
            return Ok(Vec::new());
        }

        Self::enter(user_id, ScanPhase::Indexing);
        let prepared = self.prepare(mailbox.as_ref(), &ids).await?;

        Self::enter(user_id, ScanPhase::Classifying);
        let requests: Vec<ClassificationRequest> = prepared
            .iter()
            .filter_map(|p| match p {
                Prepared::Fresh { meta, .. } => Some(ClassificationRequest {
                    id: meta.id.clone(),
                    subject: meta.subject.clone(),
                    snippet: meta.snippet.clone(),
                }),
                Prepared::Recorded { .. } => None,
            })
            .collect();
        let mut classifications = self.classifier.classify_batch(&requests).await;

        let mut labels = LabelApplier::new(mailbox.as_ref());
        let mut created = Vec::with_capacity(prepared.len());
        for item in prepared {
            let (message_id, outcome) = match item {
                Prepared::Recorded {
                    message_id,
                    existing,
                } => {
                    let outcome = self
                        .relabel(user_id, &mut labels, &message_id, existing)
                        .await
                        .map(|_| None);
                    (message_id, outcome)
                }
                Prepared::Fresh { raw, meta } => {
                    let message_id = meta.id.clone();
                    let classification =
                        classifications.remove(&message_id).unwrap_or_else(|| {
                            warn!("No classification returned for {}, using fallback", message_id);
                            EmailClassification::fallback()
                        });
                    let outcome = self
                        .process_message(
                            user_id,
                            mailbox.as_ref(),
                            &mut labels,
                            &raw,
                            meta,
                            classification,
                        )
                        .await
                        .map(Some);
                    (message_id, outcome)
                }
            };

            match outcome {
                Ok(Some(record_id)) => created.push(record_id),
                Ok(None) => {}
                Err(e) => {
                    error!("[{}] Message {} failed: {}", user_id, message_id, e);
                    return Err(ScanError::for_message(message_id, e));
                }
            }
        }

        if !labels.created_labels().is_empty() {
            info!("[{}] Created labels: {:?}", user_id, labels.created_labels());
        }
        info!("[{}] Recorded {} new messages", user_id, created.len());
        Self::enter(user_id, ScanPhase::Done);
        Ok(created)
    }

    /// Authenticate, retrying once unless the grant was revoked
    async fn connect(&self, user_id: &str) -> Result<Arc<dyn MailProvider>> {
        match self.auth.connect(user_id).await {
            Err(ScanError::Auth(failure)) if failure.is_retriable() => {
                warn!("[{}] Authentication failed ({}), retrying once", user_id, failure);
                self.auth.connect(user_id).await
            }
            other => other,
        }
    }

    /// Download, index and normalize the fetched messages, keeping fetch order
    ///
    /// Messages the store already holds skip indexing and classification.
    async fn prepare(&self, mailbox: &dyn MailProvider, ids: &[String]) -> Result<Vec<Prepared>> {
        let owner = mailbox.profile_address().await?;

        let messages: Vec<RawMessage> = stream::iter(ids)
            .map(|id| mailbox.get_message(id))
            .buffered(self.options.prefetch_concurrency)
            .try_collect()
            .await?;

        let mut indexer =
            ThreadPositionIndexer::new(mailbox, &owner, self.options.thread_cache_capacity);
        let mut prepared = Vec::with_capacity(messages.len());
        for raw in messages {
            if let Some(existing) = self.store.find_processed(&raw.id).await? {
                prepared.push(Prepared::Recorded {
                    message_id: raw.id,
                    existing,
                });
                continue;
            }
            let position = indexer.position(&raw.thread_id, &raw.id).await?;
            let meta = EmailMeta {
                id: raw.id.clone(),
                thread_id: raw.thread_id.clone(),
                sender: normalize_sender(raw.header("From").unwrap_or_default()),
                subject: normalize_subject(raw.header("Subject"), &raw.thread_id, position),
                date: message_date(&raw),
                snippet: raw.snippet.clone(),
            };
            prepared.push(Prepared::Fresh { raw, meta });
        }
        debug!(
            "Indexed {} messages across {} threads",
            prepared.len(),
            indexer.cached_threads()
        );
        Ok(prepared)
    }

    async fn process_message(
        &self,
        user_id: &str,
        mailbox: &dyn MailProvider,
        labels: &mut LabelApplier<'_>,
        raw: &RawMessage,
        meta: EmailMeta,
        classification: EmailClassification,
    ) -> Result<String> {
        let category = classification.category;
        let mut files = Vec::new();
        if category.is_financial() {
            Self::enter_message(user_id, &meta.id, ScanPhase::Extracting);
            let hint = invoice_hint(&meta.subject);
            let attachments = AttachmentCollector::new(mailbox)
                .collect(&meta.id, raw.payload.as_ref(), category)
                .await?;

            if !attachments.is_empty() {
                Self::enter_message(user_id, &meta.id, ScanPhase::Archiving);
                files = self.archive_attachments(user_id, &meta, hint, attachments).await?;
            }
        }

        Self::enter_message(user_id, &meta.id, ScanPhase::Persisting);
        let record = ProcessedEmailRecord {
            user_id: user_id.to_string(),
            email: meta,
            classification,
            files,
        };
        let label = record.label();
        let record_id = match self.store.record_outcome(&record).await {
            Ok(record_id) => record_id,
            Err(e) => return Err(orphaned(&record, e)),
        };

        Self::enter_message(user_id, &record.email.id, ScanPhase::Labeling);
        labels.apply(label, &[record.email.id.clone()]).await?;
        self.store.attach_remote_label(&record_id, label).await?;

        debug!(
            "[{}] {} recorded as {} ({}, confidence {:.2})",
            user_id,
            record.email.id,
            record_id,
            label,
            record.classification.confidence()
        );
        Ok(record_id)
    }

    /// Re-apply the stored label of a message recorded by an earlier invocation
    async fn relabel(
        &self,
        user_id: &str,
        labels: &mut LabelApplier<'_>,
        message_id: &str,
        existing: ProcessedRef,
    ) -> Result<()> {
        info!(
            "[{}] {} already recorded as {}, re-applying label {}",
            user_id, message_id, existing.record_id, existing.label
        );
        Self::enter_message(user_id, message_id, ScanPhase::Labeling);
        labels.apply(&existing.label, &[message_id.to_string()]).await?;
        if existing.remote_label.is_none() {
            self.store
                .attach_remote_label(&existing.record_id, &existing.label)
                .await?;
        }
        Ok(())
    }

    /// Upload attachments, then log one ledger row per stored file
    async fn archive_attachments(
        &self,
        user_id: &str,
        meta: &EmailMeta,
        hint: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Vec<ArchivedFile>> {
        let uploads: Vec<ArchiveUpload> = attachments
            .into_iter()
            .map(|a| ArchiveUpload {
                filename: a.filename,
                data: a.data,
                sender: meta.sender.clone(),
                invoice_number: hint.clone(),
                date: meta.date,
            })
            .collect();

        let stored = self.archive.upload_files(user_id, &uploads).await?;
        if stored.len() != uploads.len() {
            return Err(ScanError::UploadError(format!(
                "archive returned {} ids for {} files",
                stored.len(),
                uploads.len()
            )));
        }

        let entries: Vec<LedgerEntry> = stored
            .iter()
            .map(|file| LedgerEntry {
                sender: meta.sender.clone(),
                subject: meta.subject.clone(),
                date: meta.date,
                invoice_number: hint.clone(),
                file_id: file.id.clone(),
            })
            .collect();

        let rows = match self.ledger.log_files(user_id, &entries).await {
            Ok(rows) => rows,
            Err(e) => {
                let ids: Vec<&str> = stored.iter().map(|f| f.id.as_str()).collect();
                error!("[{}] Ledger failed after upload, orphaned files {:?}", user_id, ids);
                return Err(e);
            }
        };
        if rows.len() != entries.len() {
            return Err(ScanError::LoggingError(format!(
                "ledger returned {} rows for {} files",
                rows.len(),
                entries.len()
            )));
        }

        info!("[{}] Archived {} files for {}", user_id, stored.len(), meta.id);
        Ok(uploads
            .iter()
            .zip(stored)
            .zip(rows)
            .map(|((upload, file), row)| ArchivedFile {
                file_id: file.id,
                file_name: structured_name(upload),
                file_url: file.url,
                folder: file.folder,
                ledger_row_id: row,
            })
            .collect())
    }
}

/// Report remote files and ledger rows left without a local record
fn orphaned(record: &ProcessedEmailRecord, e: ScanError) -> ScanError {
    if record.files.is_empty() {
        return e;
    }
    let file_ids: Vec<&str> = record.files.iter().map(|f| f.file_id.as_str()).collect();
    let row_ids: Vec<&str> = record.files.iter().map(|f| f.ledger_row_id.as_str()).collect();
    error!(
        "[{}] Persisting {} failed, orphaned files {:?} and ledger rows {:?}",
        record.user_id, record.email.id, file_ids, row_ids
    );
    match e {
        ScanError::PersistenceError(message) => ScanError::PersistenceError(format!(
            "{} (orphaned files {:?}, ledger rows {:?})",
            message, file_ids, row_ids
        )),
        other => other,
    }
}
