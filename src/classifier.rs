//! Batch email classification through a language model
//!
//! One model request per batch. Anything the model gets wrong degrades to
//! `non-financial:other` with confidence 0 instead of failing the scan.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::llm::LlmClient;
use crate::models::{ClassificationRequest, EmailCategory, EmailClassification};

const PROMPT_HEADER: &str = r#"You are an email classifier.
Classify EACH email into one of the following categories:

1. "financial" -> invoices, salary slips, tax, bank, payments, receipts.
2. "non-financial:personal" -> personal/family/friend messages.
3. "non-financial:appointments" -> booking confirmations, hospital visits, tickets.
4. "non-financial:government" -> identity documents, tax department, government notifications.
5. "non-financial:other" -> newsletters, promotions, spam, updates, uncategorized.

Return a JSON array ONLY in this format:
[
  {
    "id": "<email-id>",
    "category": "financial" | "non-financial:personal" | "non-financial:appointments" | "non-financial:government" | "non-financial:other",
    "confidence": number between 0 and 1
  }
]

Emails:
"#;

#[derive(Serialize)]
struct PromptEmail<'a> {
    id: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// Prompt listing the categories and the batch as JSON
pub fn build_prompt(batch: &[ClassificationRequest]) -> String {
    let emails: Vec<PromptEmail<'_>> = batch
        .iter()
        .map(|r| PromptEmail {
            id: &r.id,
            subject: &r.subject,
            body: &r.snippet,
        })
        .collect();
    // Serializing borrowed strings cannot fail
    let listing = serde_json::to_string_pretty(&emails).unwrap_or_default();
    format!("{}{}\n", PROMPT_HEADER, listing)
}

fn strip_code_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```", "").trim().to_string()
}

/// Classification for one model answer
///
/// Unknown category strings degrade to the fallback, dropping the model's
/// confidence along with its category.
pub fn parse_classification(category: &str, confidence: Option<&Value>) -> EmailClassification {
    match EmailCategory::from_wire(category) {
        Some(category) => EmailClassification::new(category, parse_confidence(confidence)),
        None => {
            warn!("Unexpected category string from model: {:?}", category);
            EmailClassification::fallback()
        }
    }
}

fn parse_confidence(value: Option<&Value>) -> f32 {
    value.and_then(Value::as_f64).map(|v| v as f32).unwrap_or(0.0)
}

/// Parse a model response into classifications
///
/// Returns `None` when the text is not a JSON array. Entries without an id,
/// or with an id outside `batch`, are skipped; ids the model omitted are
/// simply absent.
pub fn parse_response(
    raw: &str,
    batch: &[ClassificationRequest],
) -> Option<HashMap<String, EmailClassification>> {
    let cleaned = strip_code_fences(raw);
    let items = match serde_json::from_str::<Value>(&cleaned) {
        Ok(Value::Array(items)) => items,
        Ok(other) => {
            warn!("Model response is not a JSON array: {}", other);
            return None;
        }
        Err(e) => {
            warn!("Model response is not valid JSON: {}", e);
            return None;
        }
    };

    let mut result = HashMap::with_capacity(items.len());
    for item in &items {
        let Some(id) = item.get("id").and_then(Value::as_str) else {
            debug!("Skipping classification entry without id: {}", item);
            continue;
        };
        if !batch.iter().any(|r| r.id == id) {
            debug!("Ignoring classification for unknown id {}", id);
            continue;
        }
        let classification = parse_classification(
            item.get("category").and_then(Value::as_str).unwrap_or(""),
            item.get("confidence"),
        );
        result.insert(id.to_string(), classification);
    }
    Some(result)
}

/// Every id in the batch mapped to the fallback classification
pub fn fallback_classification(
    batch: &[ClassificationRequest],
) -> HashMap<String, EmailClassification> {
    batch
        .iter()
        .map(|r| (r.id.clone(), EmailClassification::fallback()))
        .collect()
}

pub struct Classifier {
    llm: Arc<dyn LlmClient>,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Classify a batch with a single model call; never fails
    pub async fn classify_batch(
        &self,
        batch: &[ClassificationRequest],
    ) -> HashMap<String, EmailClassification> {
        if batch.is_empty() {
            return HashMap::new();
        }

        let prompt = build_prompt(batch);
        debug!("Classifying {} emails", batch.len());

        match self.llm.complete(&prompt).await {
            Ok(Some(raw)) if !raw.trim().is_empty() => {
                debug!("Raw model response: {}", raw);
                parse_response(&raw, batch).unwrap_or_else(|| {
                    error!("Unparseable classification response, using fallback");
                    fallback_classification(batch)
                })
            }
            Ok(_) => {
                error!("Model returned empty response for batch classification");
                fallback_classification(batch)
            }
            Err(e) => {
                error!("Failed to classify emails, using fallback: {}", e);
                fallback_classification(batch)
            }
        }
    }
}
