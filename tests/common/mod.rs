//! Common test utilities and fixtures
//!
//! In-memory stand-ins for every collaborator of the scan pipeline. The fake
//! mailbox understands the `-label:` terms of the listing query, so labelling
//! a message really does hide it from the next scan.

#![allow(dead_code)]

use async_trait::async_trait;
use inbox_ledger::error::{AuthFailure, Result, ScanError};
use inbox_ledger::models::{
    ArchiveUpload, LabelInfo, LedgerEntry, ListRequest, MessagePage, MessagePart, RawMessage,
    StoredFile,
};
use inbox_ledger::{ArchiveStore, AuthProvider, LedgerSink, LlmClient, MailProvider};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const OWNER: &str = "me@example.com";

/// Build a message as the mailbox would return it
pub fn message(id: &str, thread_id: &str, from: &str, subject: &str, timestamp: i64) -> RawMessage {
    RawMessage {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        headers: vec![
            ("From".to_string(), from.to_string()),
            ("Subject".to_string(), subject.to_string()),
        ],
        snippet: format!("snippet of {}", id),
        internal_date: timestamp,
        payload: Some(MessagePart {
            mime_type: Some("multipart/mixed".to_string()),
            ..Default::default()
        }),
    }
}

/// Attach a file part to a message
pub fn with_attachment(mut raw: RawMessage, filename: &str, attachment_id: &str) -> RawMessage {
    let part = MessagePart {
        part_id: Some(attachment_id.to_string()),
        mime_type: Some("application/pdf".to_string()),
        filename: Some(filename.to_string()),
        attachment_id: Some(attachment_id.to_string()),
        parts: Vec::new(),
    };
    if let Some(payload) = raw.payload.as_mut() {
        payload.parts.push(part);
    }
    raw
}

#[derive(Default)]
struct MailboxState {
    inbox: Vec<String>,
    messages: HashMap<String, RawMessage>,
    message_labels: HashMap<String, HashSet<String>>,
    labels: Vec<LabelInfo>,
    attachments: HashMap<(String, String), Vec<u8>>,
    failing_attachments: HashSet<String>,
    fail_labeling: bool,
    modify_calls: Vec<(Vec<String>, String)>,
    queries: Vec<String>,
}

/// Stateful in-memory mailbox
#[derive(Default)]
pub struct FakeMailbox {
    state: Mutex<MailboxState>,
}

impl FakeMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a message to the inbox
    pub fn deliver(&self, raw: RawMessage) {
        let mut state = self.state.lock().unwrap();
        state.inbox.push(raw.id.clone());
        state.messages.insert(raw.id.clone(), raw);
    }

    /// Add a thread member that is not in the inbox (e.g. a sent message)
    pub fn add_to_thread(&self, raw: RawMessage) {
        let mut state = self.state.lock().unwrap();
        state.messages.insert(raw.id.clone(), raw);
    }

    pub fn put_attachment(&self, message_id: &str, attachment_id: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.attachments.insert(
            (message_id.to_string(), attachment_id.to_string()),
            data.to_vec(),
        );
    }

    pub fn fail_attachment(&self, attachment_id: &str, failing: bool) {
        let mut state = self.state.lock().unwrap();
        if failing {
            state.failing_attachments.insert(attachment_id.to_string());
        } else {
            state.failing_attachments.remove(attachment_id);
        }
    }

    pub fn fail_labeling(&self, failing: bool) {
        self.state.lock().unwrap().fail_labeling = failing;
    }

    /// Every batch-modify call as (message ids, label name)
    pub fn label_applications(&self) -> Vec<(Vec<String>, String)> {
        self.state.lock().unwrap().modify_calls.clone()
    }

    pub fn labels_of(&self, message_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .message_labels
            .get(message_id)
            .map(|ids| {
                state
                    .labels
                    .iter()
                    .filter(|l| ids.contains(&l.id))
                    .map(|l| l.name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn label_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.labels.iter().map(|l| l.name.clone()).collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }
}

#[async_trait]
impl MailProvider for FakeMailbox {
    async fn profile_address(&self) -> Result<String> {
        Ok(OWNER.to_string())
    }

    async fn list_messages(
        &self,
        request: &ListRequest,
        page_token: Option<String>,
    ) -> Result<MessagePage> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(request.query.clone());

        let excluded: HashSet<String> = request
            .query
            .split_whitespace()
            .filter_map(|term| term.strip_prefix("-label:"))
            .filter_map(|name| state.labels.iter().find(|l| l.name == name))
            .map(|l| l.id.clone())
            .collect();

        let matching: Vec<String> = state
            .inbox
            .iter()
            .filter(|id| {
                state
                    .message_labels
                    .get(*id)
                    .map(|labels| labels.is_disjoint(&excluded))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        let start: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let end = (start + request.page_size as usize).min(matching.len());
        Ok(MessagePage {
            ids: matching[start..end].to_vec(),
            next_page_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage> {
        let state = self.state.lock().unwrap();
        state
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| ScanError::MessageNotFound(id.to_string()))
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Vec<RawMessage>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .values()
            .filter(|m| m.thread_id == thread_id)
            .cloned()
            .collect())
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        Ok(self.state.lock().unwrap().labels.clone())
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let id = format!("Label_{}", state.labels.len() + 1);
        state.labels.push(LabelInfo {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn batch_modify(&self, message_ids: &[String], add_label_id: &str) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.fail_labeling {
            return Err(ScanError::ServerError {
                status: 503,
                message: "backend unavailable".to_string(),
            });
        }

        let name = state
            .labels
            .iter()
            .find(|l| l.id == add_label_id)
            .map(|l| l.name.clone())
            .ok_or_else(|| ScanError::BadRequest(format!("unknown label {}", add_label_id)))?;
        for id in message_ids {
            state
                .message_labels
                .entry(id.clone())
                .or_default()
                .insert(add_label_id.to_string());
        }
        state.modify_calls.push((message_ids.to_vec(), name));
        Ok(message_ids.len())
    }

    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        if state.failing_attachments.contains(attachment_id) {
            return Err(ScanError::NetworkError("connection reset".to_string()));
        }
        state
            .attachments
            .get(&(message_id.to_string(), attachment_id.to_string()))
            .cloned()
            .ok_or_else(|| ScanError::MessageNotFound(attachment_id.to_string()))
    }
}

/// Hands out the same mailbox, after any scripted auth failures
pub struct StaticAuth {
    mailbox: Arc<FakeMailbox>,
    failures: Mutex<VecDeque<AuthFailure>>,
    calls: AtomicUsize,
}

impl StaticAuth {
    pub fn new(mailbox: Arc<FakeMailbox>) -> Self {
        Self::failing(mailbox, Vec::new())
    }

    pub fn failing(mailbox: Arc<FakeMailbox>, failures: Vec<AuthFailure>) -> Self {
        Self {
            mailbox,
            failures: Mutex::new(failures.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn connect(&self, _user_id: &str) -> Result<Arc<dyn MailProvider>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure.into());
        }
        let mailbox: Arc<dyn MailProvider> = self.mailbox.clone();
        Ok(mailbox)
    }
}

/// Model that always gives the same answer and remembers the prompts
pub struct ScriptedLlm {
    answer: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: Some(answer.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn silent() -> Self {
        Self {
            answer: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, prompt: &str) -> Result<Option<String>> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.answer.clone())
    }
}

#[derive(Default)]
pub struct RecordingArchive {
    calls: Mutex<Vec<Vec<ArchiveUpload>>>,
    failing: Mutex<bool>,
}

impl RecordingArchive {
    pub fn calls(&self) -> Vec<Vec<ArchiveUpload>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl ArchiveStore for RecordingArchive {
    async fn upload_files(&self, _user_id: &str, files: &[ArchiveUpload]) -> Result<Vec<StoredFile>> {
        let mut calls = self.calls.lock().unwrap();
        let uploaded_before: usize = calls.iter().map(Vec::len).sum();
        calls.push(files.to_vec());
        if *self.failing.lock().unwrap() {
            return Err(ScanError::UploadError("bucket quota exceeded".to_string()));
        }
        Ok((0..files.len())
            .map(|i| {
                let id = format!("file_{}", uploaded_before + i + 1);
                StoredFile {
                    url: format!("https://files.example.com/{}", id),
                    id,
                    folder: "Invoices".to_string(),
                }
            })
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingLedger {
    entries: Mutex<Vec<LedgerEntry>>,
    failing: Mutex<bool>,
}

impl RecordingLedger {
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn fail(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

#[async_trait]
impl LedgerSink for RecordingLedger {
    async fn log_files(&self, _user_id: &str, entries: &[LedgerEntry]) -> Result<Vec<String>> {
        if *self.failing.lock().unwrap() {
            return Err(ScanError::LoggingError("sheet is read-only".to_string()));
        }
        let mut rows = self.entries.lock().unwrap();
        let start = rows.len();
        rows.extend(entries.iter().cloned());
        Ok((0..entries.len())
            .map(|i| format!("row_{}", start + i + 1))
            .collect())
    }
}

/// Classification answer in the model's wire format
pub fn llm_answer(pairs: &[(&str, &str, f64)]) -> String {
    let items: Vec<serde_json::Value> = pairs
        .iter()
        .map(|(id, category, confidence)| {
            serde_json::json!({"id": id, "category": category, "confidence": confidence})
        })
        .collect();
    serde_json::to_string(&items).unwrap()
}
