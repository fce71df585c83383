//! Label creation and application on the remote mailbox
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{Result, ScanError};
use crate::mailbox::MailProvider;

/// Ensures labels exist and applies them, one instance per scan invocation
pub struct LabelApplier<'a> {
    mailbox: &'a dyn MailProvider,
    label_cache: Option<HashMap<String, String>>, // name -> id mapping
    created_labels: Vec<String>,
}

impl<'a> LabelApplier<'a> {
    pub fn new(mailbox: &'a dyn MailProvider) -> Self {
        Self {
            mailbox,
            label_cache: None,
            created_labels: Vec::new(),
        }
    }

    /// Loads all existing labels into the cache on first use
    async fn cache(&mut self) -> Result<&mut HashMap<String, String>> {
        if self.label_cache.is_none() {
            let labels = self.mailbox.list_labels().await?;
            info!("Loaded {} existing labels into cache", labels.len());
            self.label_cache = Some(labels.into_iter().map(|l| (l.name, l.id)).collect());
        }
        Ok(self.label_cache.get_or_insert_with(HashMap::new))
    }

    /// Id of the label named exactly `name`, creating it when missing
    pub async fn ensure_label(&mut self, name: &str) -> Result<String> {
        if let Some(id) = self.cache().await?.get(name) {
            debug!("Label '{}' already exists", name);
            return Ok(id.clone());
        }

        info!("Creating label: {}", name);
        let label_id = self
            .mailbox
            .create_label(name)
            .await
            .map_err(|e| ScanError::LabelError(format!("Failed to create label '{}': {}", name, e)))?;

        self.cache().await?.insert(name.to_string(), label_id.clone());
        self.created_labels.push(name.to_string());
        Ok(label_id)
    }

    /// Apply `name` to every message in one batch call
    pub async fn apply(&mut self, name: &str, message_ids: &[String]) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }

        let label_id = self.ensure_label(name).await?;
        self.mailbox
            .batch_modify(message_ids, &label_id)
            .await
            .map_err(|e| ScanError::LabelError(format!("Failed to apply '{}': {}", name, e)))?;

        debug!("Applied label '{}' to {} messages", name, message_ids.len());
        Ok(())
    }

    /// Labels this instance had to create
    pub fn created_labels(&self) -> &[String] {
        &self.created_labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::mock::MockMailbox;
    use crate::models::LabelInfo;
    use mockall::predicate::*;

    fn existing(name: &str, id: &str) -> LabelInfo {
        LabelInfo {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_existing_label_is_reused() {
        let mut mailbox = MockMailbox::new();
        mailbox
            .expect_list_labels()
            .times(1)
            .returning(|| Ok(vec![existing("Financial", "Label_7")]));
        mailbox.expect_create_label().never();
        mailbox
            .expect_batch_modify()
            .withf(|ids, label_id| ids == &["m1".to_string()] && label_id == "Label_7")
            .times(2)
            .returning(|ids, _| Ok(ids.len()));

        let mut applier = LabelApplier::new(&mailbox);
        applier.apply("Financial", &["m1".to_string()]).await.unwrap();
        // Re-applying is harmless and does not reload labels
        applier.apply("Financial", &["m1".to_string()]).await.unwrap();
        assert!(applier.created_labels().is_empty());
    }

    #[tokio::test]
    async fn test_missing_label_created_once() {
        let mut mailbox = MockMailbox::new();
        mailbox
            .expect_list_labels()
            .times(1)
            .returning(|| Ok(vec![existing("personal", "Label_1")]));
        mailbox
            .expect_create_label()
            .with(eq("Personal"))
            .times(1)
            .returning(|_| Ok("Label_9".to_string()));
        mailbox
            .expect_batch_modify()
            .withf(|_, label_id| label_id == "Label_9")
            .times(2)
            .returning(|ids, _| Ok(ids.len()));

        let mut applier = LabelApplier::new(&mailbox);
        applier.apply("Personal", &["a".to_string(), "b".to_string()]).await.unwrap();
        applier.apply("Personal", &["c".to_string()]).await.unwrap();
        assert_eq!(applier.created_labels(), ["Personal".to_string()]);
    }

    #[tokio::test]
    async fn test_batch_failure_is_label_error() {
        let mut mailbox = MockMailbox::new();
        mailbox
            .expect_list_labels()
            .returning(|| Ok(vec![existing("Other", "Label_3")]));
        mailbox
            .expect_batch_modify()
            .returning(|_, _| Err(ScanError::Forbidden("HTTP 403".into())));

        let mut applier = LabelApplier::new(&mailbox);
        let result = applier.apply("Other", &["m1".to_string()]).await;
        assert!(matches!(result, Err(ScanError::LabelError(_))));
    }

    #[tokio::test]
    async fn test_empty_ids_is_noop() {
        let mailbox = MockMailbox::new();
        let mut applier = LabelApplier::new(&mailbox);
        applier.apply("Other", &[]).await.unwrap();
    }
}
