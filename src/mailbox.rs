//! Gmail mailbox access with rate limiting and retry logic

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_gmail1::api::{BatchModifyMessagesRequest, Label, Message};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::auth::{GmailHub, MODIFY_SCOPE};
use crate::error::{Result, ScanError};
use crate::models::{LabelInfo, ListRequest, MessagePage, MessagePart, RawMessage};

/// Gmail API allows up to 1000 messages per batch modify request
const BATCH_SIZE: usize = 1000;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Mailbox operations the pipeline needs, one handle per authenticated user
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Address of the account owner
    async fn profile_address(&self) -> Result<String>;

    /// One page of message ids matching the request
    async fn list_messages(
        &self,
        request: &ListRequest,
        page_token: Option<String>,
    ) -> Result<MessagePage>;

    /// Full message with headers and body-part tree
    async fn get_message(&self, id: &str) -> Result<RawMessage>;

    /// Every message of a thread, headers only
    async fn get_thread(&self, thread_id: &str) -> Result<Vec<RawMessage>>;

    async fn list_labels(&self) -> Result<Vec<LabelInfo>>;

    /// Create a label and return its id
    async fn create_label(&self, name: &str) -> Result<String>;

    /// Add one label to many messages; returns the number of messages modified
    async fn batch_modify(&self, message_ids: &[String], add_label_id: &str) -> Result<usize>;

    /// Decoded payload of one attachment
    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>>;
}

/// Production mailbox backed by the Gmail API
///
/// Every call holds a semaphore permit, runs under a 30 second timeout and
/// is retried with exponential backoff on transient errors.
pub struct GmailMailbox {
    hub: GmailHub,
    rate_limiter: Arc<Semaphore>,
    max_retries: u32,
}

impl GmailMailbox {
    pub fn new(hub: GmailHub, max_concurrent: usize) -> Self {
        Self {
            hub,
            rate_limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
            max_retries: 3,
        }
    }

    async fn permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.rate_limiter.acquire().await.map_err(|e| {
            ScanError::Unknown(format!("Failed to acquire rate limit permit: {}", e))
        })
    }

    /// Execute an async operation with exponential backoff retry
    async fn with_retry<T, F, Fut>(
        operation_name: &str,
        max_retries: u32,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_secs(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempts <= max_retries => {
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name,
                        attempts,
                        max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run one API call under the call timeout
    async fn timed<T, Fut>(operation_name: &str, call: Fut) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, google_gmail1::Error>>,
    {
        match tokio::time::timeout(CALL_TIMEOUT, call).await {
            Ok(result) => result.map_err(ScanError::from),
            Err(_) => {
                warn!("Gmail API {} call timed out after {:?}", operation_name, CALL_TIMEOUT);
                Err(ScanError::NetworkError(format!(
                    "API call timed out after {:?}",
                    CALL_TIMEOUT
                )))
            }
        }
    }
}

#[async_trait]
impl MailProvider for GmailMailbox {
    async fn profile_address(&self) -> Result<String> {
        let _permit = self.permit().await?;
        Self::with_retry("get_profile", self.max_retries, || async {
            let (_, profile) = Self::timed(
                "get_profile",
                self.hub.users().get_profile("me").add_scope(MODIFY_SCOPE).doit(),
            )
            .await?;

            profile
                .email_address
                .ok_or_else(|| ScanError::InvalidMessageFormat("Profile has no address".into()))
        })
        .await
    }

    async fn list_messages(
        &self,
        request: &ListRequest,
        page_token: Option<String>,
    ) -> Result<MessagePage> {
        let _permit = self.permit().await?;
        Self::with_retry("list_messages", self.max_retries, || async {
            let mut call = self
                .hub
                .users()
                .messages_list("me")
                .q(&request.query)
                .max_results(request.page_size);

            for label_id in &request.label_ids {
                call = call.add_label_ids(label_id);
            }
            if let Some(token) = page_token.as_ref() {
                call = call.page_token(token);
            }

            let (_, response) =
                Self::timed("list_messages", call.add_scope(MODIFY_SCOPE).doit()).await?;

            let ids = response
                .messages
                .unwrap_or_default()
                .into_iter()
                .filter_map(|msg_ref| msg_ref.id)
                .collect();

            Ok(MessagePage {
                ids,
                next_page_token: response.next_page_token,
            })
        })
        .await
    }

    async fn get_message(&self, id: &str) -> Result<RawMessage> {
        let _permit = self.permit().await?;
        Self::with_retry("get_message", self.max_retries, || async {
            let (_, message) = Self::timed(
                "get_message",
                self.hub
                    .users()
                    .messages_get("me", id)
                    .format("full")
                    .add_scope(MODIFY_SCOPE)
                    .doit(),
            )
            .await?;

            convert_message(message)
        })
        .await
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Vec<RawMessage>> {
        let _permit = self.permit().await?;
        Self::with_retry("get_thread", self.max_retries, || async {
            let (_, thread) = Self::timed(
                "get_thread",
                self.hub
                    .users()
                    .threads_get("me", thread_id)
                    .format("metadata")
                    .add_metadata_headers("From")
                    .add_scope(MODIFY_SCOPE)
                    .doit(),
            )
            .await?;

            thread
                .messages
                .unwrap_or_default()
                .into_iter()
                .map(convert_message)
                .collect()
        })
        .await
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        let _permit = self.permit().await?;
        Self::with_retry("list_labels", self.max_retries, || async {
            debug!("Calling Gmail API to list labels...");
            let (_, response) = Self::timed(
                "list_labels",
                self.hub.users().labels_list("me").add_scope(MODIFY_SCOPE).doit(),
            )
            .await?;

            let labels: Vec<LabelInfo> = response
                .labels
                .unwrap_or_default()
                .into_iter()
                .filter_map(|label| match (label.id, label.name) {
                    (Some(id), Some(name)) => Some(LabelInfo { id, name }),
                    _ => None,
                })
                .collect();

            debug!("Successfully parsed {} labels", labels.len());
            Ok(labels)
        })
        .await
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        let _permit = self.permit().await?;
        Self::with_retry("create_label", self.max_retries, || async {
            let label = Label {
                name: Some(name.to_string()),
                message_list_visibility: Some("show".to_string()),
                label_list_visibility: Some("labelShow".to_string()),
                ..Default::default()
            };

            let (_, created_label) = Self::timed(
                "create_label",
                self.hub
                    .users()
                    .labels_create(label, "me")
                    .add_scope(MODIFY_SCOPE)
                    .doit(),
            )
            .await?;

            created_label
                .id
                .ok_or_else(|| ScanError::LabelError("Created label has no ID".to_string()))
        })
        .await
    }

    async fn batch_modify(&self, message_ids: &[String], add_label_id: &str) -> Result<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let _permit = self.permit().await?;
        let mut total_modified = 0;

        for chunk in message_ids.chunks(BATCH_SIZE) {
            Self::with_retry("batch_modify", self.max_retries, || async {
                let request = BatchModifyMessagesRequest {
                    ids: Some(chunk.to_vec()),
                    add_label_ids: Some(vec![add_label_id.to_string()]),
                    remove_label_ids: None,
                };

                Self::timed(
                    "batch_modify",
                    self.hub
                        .users()
                        .messages_batch_modify(request, "me")
                        .add_scope(MODIFY_SCOPE)
                        .doit(),
                )
                .await?;

                Ok(())
            })
            .await?;

            total_modified += chunk.len();
        }

        Ok(total_modified)
    }

    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Vec<u8>> {
        let _permit = self.permit().await?;
        Self::with_retry("get_attachment", self.max_retries, || async {
            let (_, body) = Self::timed(
                "get_attachment",
                self.hub
                    .users()
                    .messages_attachments_get("me", message_id, attachment_id)
                    .add_scope(MODIFY_SCOPE)
                    .doit(),
            )
            .await?;

            Ok(body.data.unwrap_or_default())
        })
        .await
    }
}

/// Convert a Gmail API message into a [`RawMessage`]
fn convert_message(msg: Message) -> Result<RawMessage> {
    let id = msg
        .id
        .ok_or_else(|| ScanError::InvalidMessageFormat("Missing message ID".to_string()))?;

    let thread_id = msg
        .thread_id
        .ok_or_else(|| ScanError::InvalidMessageFormat("Missing thread ID".to_string()))?;

    let headers = msg
        .payload
        .as_ref()
        .and_then(|p| p.headers.as_ref())
        .map(|headers| {
            headers
                .iter()
                .filter_map(|h| match (&h.name, &h.value) {
                    (Some(name), Some(value)) => Some((name.clone(), value.clone())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(RawMessage {
        id,
        thread_id,
        headers,
        snippet: msg.snippet.unwrap_or_default(),
        internal_date: msg.internal_date.unwrap_or_default(),
        payload: msg.payload.map(convert_part),
    })
}

fn convert_part(part: google_gmail1::api::MessagePart) -> MessagePart {
    MessagePart {
        part_id: part.part_id,
        mime_type: part.mime_type,
        filename: part.filename,
        attachment_id: part.body.and_then(|body| body.attachment_id),
        parts: part
            .parts
            .unwrap_or_default()
            .into_iter()
            .map(convert_part)
            .collect(),
    }
}

/// Parse RFC 2822 date string
pub fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| DateTime::parse_from_rfc3339(date_str).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|e| ScanError::InvalidMessageFormat(format!("Invalid date format: {}", e)))
}

/// Delivery date of a message: the `Date` header, else the provider timestamp
pub fn message_date(message: &RawMessage) -> DateTime<Utc> {
    message
        .header("Date")
        .and_then(|value| parse_date(value).ok())
        .or_else(|| DateTime::from_timestamp_millis(message.internal_date))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_gmail1::api::{MessagePartBody, MessagePartHeader};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_parse_date() {
        assert!(parse_date("Mon, 24 Nov 2025 10:30:00 +0000").is_ok());
        assert!(parse_date("2025-11-24T10:30:00Z").is_ok());
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn test_message_date_falls_back_to_internal_date() {
        let message = RawMessage {
            headers: vec![("Date".to_string(), "garbage".to_string())],
            internal_date: 1_704_124_800_000,
            ..Default::default()
        };
        assert_eq!(message_date(&message).timestamp(), 1_704_124_800);
    }

    #[test]
    fn test_convert_message_keeps_part_tree() {
        let message = Message {
            id: Some("m1".to_string()),
            thread_id: Some("t1".to_string()),
            snippet: Some("Your invoice".to_string()),
            internal_date: Some(42),
            payload: Some(google_gmail1::api::MessagePart {
                headers: Some(vec![MessagePartHeader {
                    name: Some("From".to_string()),
                    value: Some("Billing <bill@shop.com>".to_string()),
                }]),
                mime_type: Some("multipart/mixed".to_string()),
                parts: Some(vec![google_gmail1::api::MessagePart {
                    filename: Some("invoice.pdf".to_string()),
                    body: Some(MessagePartBody {
                        attachment_id: Some("att-1".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let raw = convert_message(message).unwrap();
        assert_eq!(raw.id, "m1");
        assert_eq!(raw.internal_date, 42);
        assert_eq!(raw.header("from"), Some("Billing <bill@shop.com>"));

        let payload = raw.payload.unwrap();
        assert_eq!(payload.parts.len(), 1);
        assert_eq!(payload.parts[0].filename.as_deref(), Some("invoice.pdf"));
        assert_eq!(payload.parts[0].attachment_id.as_deref(), Some("att-1"));
    }

    #[test]
    fn test_convert_message_requires_ids() {
        let result = convert_message(Message::default());
        assert!(matches!(result, Err(ScanError::InvalidMessageFormat(_))));
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_transient_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempt_count);

        let result = GmailMailbox::with_retry("test_op", 3, || {
            let count = Arc::clone(&counter);
            async move {
                if count.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ScanError::NetworkError("Connection timeout".to_string()))
                } else {
                    Ok("success".to_string())
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_fails_on_permanent_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempt_count);

        let result = GmailMailbox::with_retry("test_op", 3, || {
            let count = Arc::clone(&counter);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(ScanError::Forbidden("Invalid credentials".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_all_retries() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempt_count);

        let result = GmailMailbox::with_retry("test_op", 3, || {
            let count = Arc::clone(&counter);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(ScanError::RateLimitExceeded { retry_after: 1 })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 4);
    }
}
