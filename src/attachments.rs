//! Attachment extraction for financial messages

use tracing::debug;

use crate::error::{Result, ScanError};
use crate::mailbox::MailProvider;
use crate::models::{Attachment, EmailCategory, MessagePart};

/// Pre-order walk collecting `(filename, attachment_id)` for every attachment part
fn attachment_parts<'p>(part: &'p MessagePart, found: &mut Vec<(&'p str, &'p str)>) {
    if let (Some(filename), Some(attachment_id)) = (&part.filename, &part.attachment_id) {
        if !filename.is_empty() && !attachment_id.is_empty() {
            found.push((filename, attachment_id));
        }
    }
    for child in &part.parts {
        attachment_parts(child, found);
    }
}

pub struct AttachmentCollector<'a> {
    mailbox: &'a dyn MailProvider,
}

impl<'a> AttachmentCollector<'a> {
    pub fn new(mailbox: &'a dyn MailProvider) -> Self {
        Self { mailbox }
    }

    /// Download every attachment of a financial message, in part order
    ///
    /// Non-financial messages yield nothing and cost no mailbox call.
    pub async fn collect(
        &self,
        message_id: &str,
        payload: Option<&MessagePart>,
        category: EmailCategory,
    ) -> Result<Vec<Attachment>> {
        let payload = match (category, payload) {
            (EmailCategory::Financial, Some(payload)) => payload,
            (EmailCategory::Financial, None) | (EmailCategory::NonFinancial(_), _) => {
                return Ok(Vec::new())
            }
        };

        let mut parts = Vec::new();
        attachment_parts(payload, &mut parts);

        let mut attachments = Vec::with_capacity(parts.len());
        for (filename, attachment_id) in parts {
            let data = self
                .mailbox
                .get_attachment(message_id, attachment_id)
                .await
                .map_err(|e| {
                    ScanError::AttachmentError(format!(
                        "{} on message {}: {}",
                        filename, message_id, e
                    ))
                })?;
            debug!("Fetched attachment {} ({} bytes)", filename, data.len());
            attachments.push(Attachment {
                filename: filename.to_string(),
                data,
            });
        }

        Ok(attachments)
    }
}
