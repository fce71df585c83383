//! Listing of inbox messages the pipeline has not labelled yet

use tracing::{debug, info};

use crate::error::Result;
use crate::mailbox::MailProvider;
use crate::models::{EmailCategory, LabelInfo, ListRequest};

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Only list messages newer than this many days; 0 disables the window
    pub newer_than_days: u32,
    pub page_size: u32,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            newer_than_days: 30,
            page_size: 10,
        }
    }
}

/// Search expression excluding spam, trash and every pipeline label that exists
///
/// Labels missing from the account are left out, since the provider rejects
/// unknown `label:` terms.
pub fn build_exclusion_query(existing_labels: &[LabelInfo], newer_than_days: u32) -> String {
    let mut terms = vec!["-in:spam".to_string(), "-in:trash".to_string()];
    if newer_than_days > 0 {
        terms.push(format!("newer_than:{}d", newer_than_days));
    }
    terms.extend(
        EmailCategory::LABELS
            .iter()
            .filter(|label| existing_labels.iter().any(|l| l.name == **label))
            .map(|label| format!("-label:{}", label)),
    );
    terms.join(" ")
}

pub struct UnprocessedMessageFetcher<'a> {
    mailbox: &'a dyn MailProvider,
    options: FetchOptions,
}

impl<'a> UnprocessedMessageFetcher<'a> {
    pub fn new(mailbox: &'a dyn MailProvider, options: FetchOptions) -> Self {
        Self { mailbox, options }
    }

    /// Every unprocessed inbox message id, in provider order
    pub async fn fetch(&self) -> Result<Vec<String>> {
        let labels = self.mailbox.list_labels().await?;
        let request = ListRequest {
            query: build_exclusion_query(&labels, self.options.newer_than_days),
            label_ids: vec!["INBOX".to_string()],
            page_size: self.options.page_size,
        };
        debug!("Listing messages with query: {}", request.query);

        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self.mailbox.list_messages(&request, page_token.take()).await?;
            pages += 1;
            ids.extend(page.ids);

            page_token = page.next_page_token.filter(|token| !token.is_empty());
            if page_token.is_none() {
                break;
            }
        }

        info!("Found {} unprocessed messages across {} pages", ids.len(), pages);
        Ok(ids)
    }
}
