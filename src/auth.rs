//! OAuth2 authentication management for Gmail API
//!
//! `authorize_user` runs the interactive consent flow once and caches the
//! user's token file. Scans only ever refresh from that cached refresh token,
//! so a revoked grant surfaces as [`AuthFailure::Revoked`] instead of a
//! browser prompt.

use async_trait::async_trait;
use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{AuthFailure, Result, ScanError};
use crate::mailbox::{GmailMailbox, MailProvider};

/// Read/write access without permanent deletion; covers labels too
pub const MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";

/// Gmail API scopes required by the pipeline
pub const REQUIRED_SCOPES: &[&str] = &[MODIFY_SCOPE];

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub =
    Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// Hands out an authenticated mailbox for a user
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn connect(&self, user_id: &str) -> Result<Arc<dyn MailProvider>>;
}

/// Token cache file for a user inside `token_dir`
pub fn token_path(token_dir: &Path, user_id: &str) -> PathBuf {
    let name: String = user_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    token_dir.join(format!("{}.json", name))
}

/// Find the first refresh token anywhere in a token cache document
fn find_refresh_token(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map
            .get("refresh_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| map.values().find_map(find_refresh_token)),
        Value::Array(items) => items.iter().find_map(find_refresh_token),
        _ => None,
    }
}

/// Classify a token endpoint failure
fn refresh_failure(error: impl std::fmt::Display) -> AuthFailure {
    let message = error.to_string();
    if message.contains("invalid_grant") {
        AuthFailure::Revoked
    } else {
        AuthFailure::RefreshFailed(message)
    }
}

type HubAuthenticator = yup_oauth2::authenticator::Authenticator<
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
>;

fn build_hub(auth: HubAuthenticator) -> Result<GmailHub> {
    // HTTP/1 works better with google-gmail1 than the HTTP/2 default
    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| {
                    ScanError::NetworkError(format!("Failed to load TLS roots: {}", e))
                })?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    Ok(Gmail::new(client, auth))
}

/// Production provider backed by per-user token files
pub struct OAuthTokenProvider {
    credentials_path: PathBuf,
    token_dir: PathBuf,
    max_concurrent: usize,
}

impl OAuthTokenProvider {
    pub fn new(
        credentials_path: impl Into<PathBuf>,
        token_dir: impl Into<PathBuf>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            credentials_path: credentials_path.into(),
            token_dir: token_dir.into(),
            max_concurrent,
        }
    }

    async fn read_secret(&self) -> Result<yup_oauth2::ApplicationSecret> {
        yup_oauth2::read_application_secret(&self.credentials_path)
            .await
            .map_err(|e| {
                ScanError::ConfigError(format!(
                    "Failed to read credentials {:?}: {}",
                    self.credentials_path, e
                ))
            })
    }

    /// Run the interactive consent flow and cache the user's tokens
    ///
    /// Returns the mailbox address the user authorized.
    pub async fn authorize_user(&self, user_id: &str, force: bool) -> Result<String> {
        let secret = self.read_secret().await?;
        let path = token_path(&self.token_dir, user_id);
        tokio::fs::create_dir_all(&self.token_dir).await?;

        if force && path.exists() {
            tokio::fs::remove_file(&path).await?;
            info!("Removed existing token cache for {}", user_id);
        }

        // HTTPRedirect opens a browser for user authorization
        let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
            secret,
            yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
        )
        .persist_tokens_to_disk(&path)
        .build()
        .await
        .map_err(|e| AuthFailure::RefreshFailed(format!("Failed to build authenticator: {}", e)))?;

        auth.token(REQUIRED_SCOPES)
            .await
            .map_err(refresh_failure)?;
        secure_token_file(&path).await?;

        let mailbox = GmailMailbox::new(build_hub(auth)?, self.max_concurrent);
        let address = mailbox.profile_address().await?;
        info!("Authorized {} as {}", user_id, address);
        Ok(address)
    }
}

#[async_trait]
impl AuthProvider for OAuthTokenProvider {
    async fn connect(&self, user_id: &str) -> Result<Arc<dyn MailProvider>> {
        let path = token_path(&self.token_dir, user_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AuthFailure::Missing.into())
            }
            Err(e) => return Err(e.into()),
        };

        let refresh_token = serde_json::from_str::<Value>(&content)
            .ok()
            .as_ref()
            .and_then(find_refresh_token)
            .ok_or(AuthFailure::Missing)?;

        let secret = self.read_secret().await?;
        let user_secret = yup_oauth2::authorized_user::AuthorizedUserSecret {
            client_id: secret.client_id,
            client_secret: secret.client_secret,
            refresh_token,
            key_type: "authorized_user".to_string(),
        };

        let auth = yup_oauth2::AuthorizedUserAuthenticator::builder(user_secret)
            .build()
            .await
            .map_err(refresh_failure)?;

        // Refresh up front so a revoked grant fails here, not mid-scan
        auth.token(REQUIRED_SCOPES)
            .await
            .map_err(refresh_failure)?;
        debug!("Refreshed access token for {}", user_id);

        let hub = build_hub(auth)?;
        Ok(Arc::new(GmailMailbox::new(hub, self.max_concurrent)))
    }
}

/// Secure token file permissions on Unix systems
///
/// Sets file permissions to 0600 (read/write for owner only)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

/// Windows uses ACLs instead of Unix permissions
#[cfg(windows)]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_token_path_sanitizes_user() {
        let path = token_path(Path::new("/tokens"), "jane.doe@x.com");
        assert_eq!(path, Path::new("/tokens/jane_doe_x_com.json"));
    }

    #[test]
    fn test_find_refresh_token_in_cache_document() {
        let cache = json!([{
            "scopes": [MODIFY_SCOPE],
            "token": {
                "access_token": "ya29.a0",
                "refresh_token": "1//0g-refresh",
                "expires_at": null
            }
        }]);
        assert_eq!(find_refresh_token(&cache).as_deref(), Some("1//0g-refresh"));
        assert_eq!(find_refresh_token(&json!([{"token": {"refresh_token": ""}}])), None);
        assert_eq!(find_refresh_token(&json!({})), None);
    }

    #[test]
    fn test_refresh_failure_classification() {
        assert_eq!(
            refresh_failure("Server error: invalid_grant: Token has been expired or revoked."),
            AuthFailure::Revoked
        );
        assert!(matches!(
            refresh_failure("connection reset"),
            AuthFailure::RefreshFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_without_token_is_missing() {
        let dir = TempDir::new().unwrap();
        let provider = OAuthTokenProvider::new("credentials.json", dir.path(), 4);
        let result = provider.connect("u1").await;
        assert!(matches!(result, Err(ScanError::Auth(AuthFailure::Missing))));
    }

    #[tokio::test]
    async fn test_connect_with_tokenless_cache_is_missing() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(token_path(dir.path(), "u1"), "[]").await.unwrap();
        let provider = OAuthTokenProvider::new("credentials.json", dir.path(), 4);
        let result = provider.connect("u1").await;
        assert!(matches!(result, Err(ScanError::Auth(AuthFailure::Missing))));
    }

    #[tokio::test]
    async fn test_secure_token_file() {
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), "test content")
            .await
            .unwrap();

        secure_token_file(temp_file.path()).await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = tokio::fs::metadata(temp_file.path()).await.unwrap();
            assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        }
    }
}
