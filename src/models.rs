use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message as returned by the mailbox, before normalization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMessage {
    pub id: String,
    pub thread_id: String,
    /// Header name/value pairs in provider order
    pub headers: Vec<(String, String)>,
    pub snippet: String,
    /// Provider delivery timestamp, milliseconds since the epoch
    pub internal_date: i64,
    pub payload: Option<MessagePart>,
}

impl RawMessage {
    /// First header with the given name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Node of the MIME body-part tree
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePart {
    pub part_id: Option<String>,
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub attachment_id: Option<String>,
    pub parts: Vec<MessagePart>,
}

/// Normalized view of a message used by classification and persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMeta {
    pub id: String,
    pub thread_id: String,
    pub sender: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub snippet: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NonFinancialKind {
    Personal,
    Appointments,
    Government,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmailCategory {
    Financial,
    NonFinancial(NonFinancialKind),
}

impl EmailCategory {
    /// Every label the pipeline can apply, in display order
    pub const LABELS: [&'static str; 5] =
        ["Financial", "Personal", "Appointment", "Government", "Other"];

    pub fn is_financial(&self) -> bool {
        matches!(self, EmailCategory::Financial)
    }

    /// Mailbox label marking a message as processed under this category
    pub fn label_name(&self) -> &'static str {
        match self {
            EmailCategory::Financial => "Financial",
            EmailCategory::NonFinancial(NonFinancialKind::Personal) => "Personal",
            EmailCategory::NonFinancial(NonFinancialKind::Appointments) => "Appointment",
            EmailCategory::NonFinancial(NonFinancialKind::Government) => "Government",
            EmailCategory::NonFinancial(NonFinancialKind::Other) => "Other",
        }
    }

    /// Category string exchanged with the language model
    pub fn wire_name(&self) -> &'static str {
        match self {
            EmailCategory::Financial => "financial",
            EmailCategory::NonFinancial(NonFinancialKind::Personal) => "non-financial:personal",
            EmailCategory::NonFinancial(NonFinancialKind::Appointments) => {
                "non-financial:appointments"
            }
            EmailCategory::NonFinancial(NonFinancialKind::Government) => {
                "non-financial:government"
            }
            EmailCategory::NonFinancial(NonFinancialKind::Other) => "non-financial:other",
        }
    }

    /// Parse a model category string, matched exactly; `None` for anything else
    pub fn from_wire(value: &str) -> Option<Self> {
        let category = match value {
            "financial" => EmailCategory::Financial,
            "non-financial:personal" => EmailCategory::NonFinancial(NonFinancialKind::Personal),
            "non-financial:appointments" => {
                EmailCategory::NonFinancial(NonFinancialKind::Appointments)
            }
            "non-financial:government" => {
                EmailCategory::NonFinancial(NonFinancialKind::Government)
            }
            "non-financial:other" => EmailCategory::NonFinancial(NonFinancialKind::Other),
            _ => return None,
        };
        Some(category)
    }

    pub fn all() -> [EmailCategory; 5] {
        [
            EmailCategory::Financial,
            EmailCategory::NonFinancial(NonFinancialKind::Personal),
            EmailCategory::NonFinancial(NonFinancialKind::Appointments),
            EmailCategory::NonFinancial(NonFinancialKind::Government),
            EmailCategory::NonFinancial(NonFinancialKind::Other),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmailClassification {
    pub category: EmailCategory,
    confidence: f32,
}

impl EmailClassification {
    /// Confidence is clamped to `[0, 1]`; NaN becomes 0
    pub fn new(category: EmailCategory, confidence: f32) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            category,
            confidence,
        }
    }

    /// Used whenever the model gives no usable answer for a message
    pub fn fallback() -> Self {
        Self::new(EmailCategory::NonFinancial(NonFinancialKind::Other), 0.0)
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// One entry of a classification batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationRequest {
    pub id: String,
    pub subject: String,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct LabelInfo {
    pub id: String,
    pub name: String,
}

/// Parameters of a paginated message listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    /// Provider search expression
    pub query: String,
    pub label_ids: Vec<String>,
    pub page_size: u32,
}

/// One page of a message listing
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// File as handed to the archive
#[derive(Debug, Clone)]
pub struct ArchiveUpload {
    pub filename: String,
    pub data: Vec<u8>,
    pub sender: String,
    pub invoice_number: Option<String>,
    pub date: DateTime<Utc>,
}

/// Where the archive put a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub id: String,
    pub url: String,
    pub folder: String,
}

/// One row handed to the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sender: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub invoice_number: Option<String>,
    pub file_id: String,
}

/// Archived file as persisted alongside its message record
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedFile {
    pub file_id: String,
    pub file_name: String,
    pub file_url: String,
    pub folder: String,
    /// Ledger row that was written for this file
    pub ledger_row_id: String,
}

/// Everything written in one persistence unit for a processed message
#[derive(Debug, Clone)]
pub struct ProcessedEmailRecord {
    pub user_id: String,
    pub email: EmailMeta,
    pub classification: EmailClassification,
    pub files: Vec<ArchivedFile>,
}

impl ProcessedEmailRecord {
    pub fn label(&self) -> &'static str {
        self.classification.category.label_name()
    }
}
