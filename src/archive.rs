//! Archive of financial attachments

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, ScanError};
use crate::models::{ArchiveUpload, StoredFile};

/// Remote or local storage for attachment files
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Store every file; results are in input order
    async fn upload_files(&self, user_id: &str, files: &[ArchiveUpload]) -> Result<Vec<StoredFile>>;
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// `{sender}_{invoice|NoInvoice}_{YYYY-MM-DD}.{ext}`
pub fn structured_name(upload: &ArchiveUpload) -> String {
    let sender = sanitize(&upload.sender);
    let invoice = upload
        .invoice_number
        .as_deref()
        .filter(|n| !n.is_empty())
        .map(sanitize)
        .unwrap_or_else(|| "NoInvoice".to_string());
    let date = upload.date.format("%Y-%m-%d");
    let extension = upload.filename.rsplit('.').next().unwrap_or_default();
    format!("{}_{}_{}.{}", sender, invoice, date, extension)
}

/// Archive writing into `{root}/{user}/{folder}/`
pub struct DirectoryArchive {
    root: PathBuf,
    folder: String,
}

impl DirectoryArchive {
    pub fn new(root: impl Into<PathBuf>, folder: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            folder: folder.into(),
        }
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        self.root.join(sanitize(user_id)).join(&self.folder)
    }

    /// First path under `dir` not taken yet, suffixing `_1`, `_2`... before the extension
    ///
    /// A path whose existence cannot be checked is an upload error, never free.
    async fn free_path(dir: &Path, name: &str) -> Result<PathBuf> {
        let candidate = dir.join(name);
        if !Self::taken(&candidate).await? {
            return Ok(candidate);
        }
        let (stem, extension) = name.rsplit_once('.').unwrap_or((name, ""));
        let mut n = 1;
        loop {
            let candidate = dir.join(format!("{}_{}.{}", stem, n, extension));
            if !Self::taken(&candidate).await? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    async fn taken(path: &Path) -> Result<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| upload_error(path, e))
    }
}

fn upload_error(path: &Path, e: std::io::Error) -> ScanError {
    ScanError::UploadError(format!("{}: {}", path.display(), e))
}

#[async_trait]
impl ArchiveStore for DirectoryArchive {
    async fn upload_files(&self, user_id: &str, files: &[ArchiveUpload]) -> Result<Vec<StoredFile>> {
        let dir = self.user_dir(user_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| upload_error(&dir, e))?;

        let mut stored = Vec::with_capacity(files.len());
        for file in files {
            let path = Self::free_path(&dir, &structured_name(file)).await?;
            tokio::fs::write(&path, &file.data)
                .await
                .map_err(|e| upload_error(&path, e))?;

            let absolute = tokio::fs::canonicalize(&path)
                .await
                .map_err(|e| upload_error(&path, e))?;
            info!("Archived {} as {}", file.filename, path.display());

            stored.push(StoredFile {
                id: Uuid::new_v4().to_string(),
                url: format!("file://{}", absolute.display()),
                folder: self.folder.clone(),
            });
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn upload(filename: &str, invoice: Option<&str>) -> ArchiveUpload {
        ArchiveUpload {
            filename: filename.to_string(),
            data: b"%PDF-1.4".to_vec(),
            sender: "billing@acme-co.com".to_string(),
            invoice_number: invoice.map(str::to_string),
            date: Utc.with_ymd_and_hms(2024, 3, 9, 23, 15, 0).unwrap(),
        }
    }

    #[test]
    fn test_structured_name() {
        assert_eq!(
            structured_name(&upload("Invoice March.pdf", Some("INV-2024"))),
            "billing_acme_co_com_INV_2024_2024-03-09.pdf"
        );
        assert_eq!(
            structured_name(&upload("statement.tar.gz", None)),
            "billing_acme_co_com_NoInvoice_2024-03-09.gz"
        );
        assert_eq!(
            structured_name(&upload("README", Some(""))),
            "billing_acme_co_com_NoInvoice_2024-03-09.README"
        );
    }

    #[tokio::test]
    async fn test_upload_writes_files_in_order() {
        let root = TempDir::new().unwrap();
        let archive = DirectoryArchive::new(root.path(), "Invoices");

        let files = vec![upload("a.pdf", Some("1234")), upload("b.pdf", Some("1234"))];
        let stored = archive.upload_files("user@x.com", &files).await.unwrap();

        assert_eq!(stored.len(), 2);
        assert_ne!(stored[0].id, stored[1].id);
        assert!(stored[0].url.ends_with("billing_acme_co_com_1234_2024-03-09.pdf"));
        assert!(stored[1].url.ends_with("billing_acme_co_com_1234_2024-03-09_1.pdf"));
        assert_eq!(stored[0].folder, "Invoices");

        let written = root
            .path()
            .join("user_x_com")
            .join("Invoices")
            .join("billing_acme_co_com_1234_2024-03-09.pdf");
        assert_eq!(std::fs::read(written).unwrap(), b"%PDF-1.4");
    }

    #[tokio::test]
    async fn test_existing_files_are_never_overwritten() {
        let root = TempDir::new().unwrap();
        let archive = DirectoryArchive::new(root.path(), "Invoices");
        let dir = root.path().join("u1").join("Invoices");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("billing_acme_co_com_1234_2024-03-09.pdf"), b"old").unwrap();

        let stored = archive
            .upload_files("u1", &[upload("a.pdf", Some("1234"))])
            .await
            .unwrap();

        assert!(stored[0].url.ends_with("billing_acme_co_com_1234_2024-03-09_1.pdf"));
        assert_eq!(
            std::fs::read(dir.join("billing_acme_co_com_1234_2024-03-09.pdf")).unwrap(),
            b"old"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_directory_is_upload_error() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        let dir = root.path().join("u1").join("Invoices");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o000)).unwrap();

        // Root ignores directory permissions, so the check only means something for other users
        let access = std::fs::metadata(dir.join("x"));
        let blocked = matches!(&access, Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied);

        let archive = DirectoryArchive::new(root.path(), "Invoices");
        let result = archive
            .upload_files("u1", &[upload("a.pdf", Some("1234"))])
            .await;

        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();
        if blocked {
            assert!(matches!(result, Err(ScanError::UploadError(_))));
        }
    }
}
