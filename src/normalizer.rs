//! Subject and sender normalization
//!
//! Pure functions, shared by the thread indexer and the orchestrator.

use once_cell::sync::Lazy;
use regex::Regex;

static REPLY_PREFIXES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:(?:re|fwd):\s*)+").unwrap());

static ANGLE_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*?)\s*<(.+?)>$").unwrap());

/// Strip any leading chain of `Re:` / `Fwd:` prefixes
pub fn strip_reply_prefixes(subject: &str) -> String {
    REPLY_PREFIXES
        .replace(subject.trim_start(), "")
        .trim()
        .to_string()
}

/// Clean a subject line, falling back to a synthetic subject when nothing is left
///
/// `reply_index` is the 0-based position of the message in its thread; the
/// synthetic subject numbers from 1, e.g. `t-42_2nd_mail`.
pub fn normalize_subject(subject: Option<&str>, thread_id: &str, reply_index: usize) -> String {
    let stripped = subject.map(strip_reply_prefixes).unwrap_or_default();
    if !stripped.is_empty() {
        return stripped;
    }
    format!("{}_{}_mail", thread_id, ordinal(reply_index + 1))
}

/// `1 -> 1st`, `2 -> 2nd`, `11 -> 11th`, `21 -> 21st`
pub fn ordinal(n: usize) -> String {
    let (j, k) = (n % 10, n % 100);
    let suffix = match (j, k) {
        (1, k) if k != 11 => "st",
        (2, k) if k != 12 => "nd",
        (3, k) if k != 13 => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}

/// Reduce a `From` header to a lowercase address
pub fn normalize_sender(sender: &str) -> String {
    let sender = sender.trim();
    if sender.is_empty() {
        return String::new();
    }
    match ANGLE_ADDRESS.captures(sender) {
        Some(captures) => captures[2].trim().to_lowercase(),
        None => sender.to_lowercase(),
    }
}
