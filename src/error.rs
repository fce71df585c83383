use thiserror::Error;

/// Type alias for Result with ScanError
pub type Result<T> = std::result::Result<T, ScanError>;

/// Why a user's mailbox credentials could not be turned into a live session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// No stored token for the user
    #[error("no stored credentials; run `auth` first")]
    Missing,

    /// Token refresh failed for a reason that may clear up on retry
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// The refresh token was revoked; the user must re-authenticate
    #[error("access was revoked; re-authentication required")]
    Revoked,
}

impl AuthFailure {
    /// Revoked grants never recover without user action
    pub fn is_retriable(&self) -> bool {
        !matches!(self, AuthFailure::Revoked)
    }
}

/// Error types for the scan-classify-persist pipeline
#[derive(Error, Debug)]
pub enum ScanError {
    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(AuthFailure),

    /// Gmail API returned an error
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Invalid message format or parsing error
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// LLM call failed; the classifier recovers from this with a fallback
    #[error("Classification error: {0}")]
    ClassificationError(String),

    /// Attachment payload could not be fetched
    #[error("Attachment error: {0}")]
    AttachmentError(String),

    /// Archive upload failed
    #[error("Upload error: {0}")]
    UploadError(String),

    /// Ledger append failed
    #[error("Ledger error: {0}")]
    LoggingError(String),

    /// Relational store failure
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// The message id is already recorded
    #[error("Message already processed: {0}")]
    DuplicateMessage(String),

    /// Label-related errors
    #[error("Label error: {0}")]
    LabelError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No user registered under this id
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// A single message failed; earlier messages stay committed
    #[error("Processing message {message_id} failed: {source}")]
    MessageFailed {
        message_id: String,
        #[source]
        source: Box<ScanError>,
    },

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic catch-all error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ScanError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScanError::RateLimitExceeded { .. }
                | ScanError::ServerError { .. }
                | ScanError::NetworkError(_)
        )
    }

    /// Wrap a per-message failure with the id of the message that caused it
    pub fn for_message(message_id: impl Into<String>, source: ScanError) -> Self {
        ScanError::MessageFailed {
            message_id: message_id.into(),
            source: Box::new(source),
        }
    }

    /// Stable tag used in structured error output
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::Auth(AuthFailure::Missing) => "auth_missing",
            ScanError::Auth(AuthFailure::RefreshFailed(_)) => "auth_refresh_failed",
            ScanError::Auth(AuthFailure::Revoked) => "auth_revoked",
            ScanError::ApiError(_)
            | ScanError::RateLimitExceeded { .. }
            | ScanError::NetworkError(_)
            | ScanError::ServerError { .. }
            | ScanError::MessageNotFound(_)
            | ScanError::BadRequest(_)
            | ScanError::Forbidden(_)
            | ScanError::InvalidMessageFormat(_) => "mailbox_error",
            ScanError::ClassificationError(_) => "classification_error",
            ScanError::AttachmentError(_) => "attachment_error",
            ScanError::UploadError(_) => "upload_error",
            ScanError::LoggingError(_) => "logging_error",
            ScanError::PersistenceError(_) => "persistence_error",
            ScanError::DuplicateMessage(_) => "duplicate_message",
            ScanError::LabelError(_) => "label_error",
            ScanError::ConfigError(_) => "config_error",
            ScanError::UnknownUser(_) => "unknown_user",
            ScanError::MessageFailed { source, .. } => source.kind(),
            ScanError::IoError(_) => "io_error",
            ScanError::SerializationError(_) => "serialization_error",
            ScanError::Unknown(_) => "unknown",
        }
    }
}

impl From<AuthFailure> for ScanError {
    fn from(failure: AuthFailure) -> Self {
        ScanError::Auth(failure)
    }
}

impl From<rusqlite::Error> for ScanError {
    fn from(error: rusqlite::Error) -> Self {
        ScanError::PersistenceError(error.to_string())
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// Only the delay-seconds form is honoured. A missing or non-numeric header
/// falls back to 5 seconds.
fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

impl From<google_gmail1::Error> for ScanError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            // HTTP response with status code (non-success responses)
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    429 => {
                        let retry_after = parse_retry_after_header(response);
                        ScanError::RateLimitExceeded { retry_after }
                    }
                    404 => ScanError::MessageNotFound("Resource not found".to_string()),
                    400 => ScanError::BadRequest(message),
                    403 => ScanError::Forbidden(message),
                    500..=599 => ScanError::ServerError {
                        status: status_code,
                        message,
                    },
                    _ => ScanError::ApiError(message),
                }
            }
            google_gmail1::Error::BadRequest(ref err) => ScanError::BadRequest(format!("{}", err)),
            // Network/connection errors - transient
            google_gmail1::Error::HttpError(ref err) => {
                ScanError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => ScanError::NetworkError(err.to_string()),
            _ => ScanError::ApiError(error.to_string()),
        }
    }
}
