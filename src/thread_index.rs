//! Reply positions of messages within their threads
//!
//! The cache belongs to one scan invocation and is dropped with it.

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use tracing::debug;

use crate::error::Result;
use crate::mailbox::MailProvider;
use crate::models::RawMessage;
use crate::normalizer::normalize_sender;

/// Message id to 0-based position among other-party messages
pub type ThreadIndex = HashMap<String, usize>;

/// Order a thread's other-party messages by delivery time
///
/// Messages from `owner` are dropped. Equal timestamps keep provider order.
pub fn build_thread_index(messages: &[RawMessage], owner: &str) -> ThreadIndex {
    let owner = normalize_sender(owner);
    let mut others: Vec<&RawMessage> = messages
        .iter()
        .filter(|m| normalize_sender(m.header("From").unwrap_or_default()) != owner)
        .collect();
    others.sort_by_key(|m| m.internal_date);

    others
        .into_iter()
        .enumerate()
        .map(|(position, m)| (m.id.clone(), position))
        .collect()
}

pub struct ThreadPositionIndexer<'a> {
    mailbox: &'a dyn MailProvider,
    owner: String,
    cache: LruCache<String, ThreadIndex>,
}

impl<'a> ThreadPositionIndexer<'a> {
    pub fn new(mailbox: &'a dyn MailProvider, owner: &str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            mailbox,
            owner: normalize_sender(owner),
            cache: LruCache::new(capacity),
        }
    }

    /// Position of `message_id` in `thread_id`; ids not in the index get 0
    pub async fn position(&mut self, thread_id: &str, message_id: &str) -> Result<usize> {
        if let Some(index) = self.cache.get(thread_id) {
            return Ok(index.get(message_id).copied().unwrap_or(0));
        }

        let messages = self.mailbox.get_thread(thread_id).await?;
        let index = build_thread_index(&messages, &self.owner);
        debug!(
            "Indexed thread {} ({} of {} messages from other parties)",
            thread_id,
            index.len(),
            messages.len()
        );

        let position = index.get(message_id).copied().unwrap_or(0);
        self.cache.put(thread_id.to_string(), index);
        Ok(position)
    }

    pub fn cached_threads(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::mock::MockMailbox;
    use mockall::predicate::*;

    fn message(id: &str, from: &str, at: i64) -> RawMessage {
        RawMessage {
            id: id.to_string(),
            thread_id: "t1".to_string(),
            headers: vec![("From".to_string(), from.to_string())],
            internal_date: at,
            ..Default::default()
        }
    }

    fn sample_thread() -> Vec<RawMessage> {
        vec![
            message("m3", "Bob <bob@x.com>", 300),
            message("me1", "Me <ME@home.org>", 150),
            message("m1", "bob@x.com", 100),
            message("m2", "Carol <carol@y.com>", 200),
        ]
    }

    #[test]
    fn test_owner_excluded_and_sorted_by_time() {
        let index = build_thread_index(&sample_thread(), "me@home.org");
        assert_eq!(index.len(), 3);
        assert_eq!(index["m1"], 0);
        assert_eq!(index["m2"], 1);
        assert_eq!(index["m3"], 2);
        assert!(!index.contains_key("me1"));
    }

    #[test]
    fn test_ties_keep_provider_order() {
        let thread = vec![
            message("b", "x@x.com", 100),
            message("a", "y@y.com", 100),
        ];
        let index = build_thread_index(&thread, "me@home.org");
        assert_eq!(index["b"], 0);
        assert_eq!(index["a"], 1);
    }

    #[tokio::test]
    async fn test_thread_fetched_once_per_invocation() {
        let mut mailbox = MockMailbox::new();
        mailbox
            .expect_get_thread()
            .with(eq("t1"))
            .times(1)
            .returning(|_| Ok(sample_thread()));

        let mut indexer = ThreadPositionIndexer::new(&mailbox, "Me <me@home.org>", 16);
        assert_eq!(indexer.position("t1", "m3").await.unwrap(), 2);
        assert_eq!(indexer.position("t1", "m2").await.unwrap(), 1);
        assert_eq!(indexer.cached_threads(), 1);
    }

    #[tokio::test]
    async fn test_unknown_message_defaults_to_zero() {
        let mut mailbox = MockMailbox::new();
        mailbox
            .expect_get_thread()
            .returning(|_| Ok(sample_thread()));

        let mut indexer = ThreadPositionIndexer::new(&mailbox, "me@home.org", 16);
        assert_eq!(indexer.position("t1", "me1").await.unwrap(), 0);
        assert_eq!(indexer.position("t1", "nope").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let mut mailbox = MockMailbox::new();
        mailbox
            .expect_get_thread()
            .times(3)
            .returning(|_| Ok(sample_thread()));

        let mut indexer = ThreadPositionIndexer::new(&mailbox, "me@home.org", 1);
        indexer.position("t1", "m1").await.unwrap();
        indexer.position("t2", "m1").await.unwrap();
        // t1 was evicted by t2
        indexer.position("t1", "m1").await.unwrap();
        assert_eq!(indexer.cached_threads(), 1);
    }
}
