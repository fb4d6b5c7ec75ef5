//! Durable credential and account index storage
//!
//! Layout under the data directory:
//!
//! ```text
//! accounts.json              ordered account index (AccountEntry list)
//! credentials/<key>.json     one CredentialRecord per account
//! ```
//!
//! Every write goes to a uniquely named temp file in the same directory,
//! is synced to disk, and is renamed over the target, so neither readers nor
//! a crash mid-write leave a half-written record. On unix, files are created with mode `0600`.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

/// Index file format version
const INDEX_VERSION: u32 = 1;
const INDEX_FILE: &str = "accounts.json";
const CREDENTIALS_DIR: &str = "credentials";

/// Per-account OAuth credential
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Account key, lowercase email
    pub account_email: String,
    /// OAuth client id the tokens were issued to
    pub client_id: String,
    /// OAuth client secret paired with `client_id`
    pub client_secret: String,
    /// Long-lived token used to mint access tokens
    pub refresh_token: String,
    /// Short-lived bearer token; empty when never issued
    #[serde(default)]
    pub access_token: String,
    /// Instant at which `access_token` stops being valid
    pub expires_at: DateTime<Utc>,
    /// Scopes granted at consent time
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl CredentialRecord {
    /// A record without a refresh token can only be recovered by re-consent
    pub fn is_usable(&self) -> bool {
        !self.refresh_token.trim().is_empty()
    }

    /// Expiry is inclusive: a token expiring exactly at `now` is expired
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.access_token.is_empty() || now >= self.expires_at
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("account_email", &self.account_email)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("access_token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Registry metadata for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    /// Account key, same as `CredentialRecord::account_email`
    pub email: String,
    /// When the account was added; never changes afterwards
    pub added_at: DateTime<Utc>,
    /// Last successful operation on this account
    pub last_used_at: DateTime<Utc>,
    /// Whether tool calls without an account argument use this account
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    accounts: Vec<AccountEntry>,
}

/// File-backed store for account index and credentials
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Data directory this store writes to
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load the credential for `email`
    ///
    /// Returns `Ok(None)` when no credential file exists.
    ///
    /// # Errors
    ///
    /// - `Storage` on I/O failure
    /// - `CorruptCredential` if the file is not a valid record for `email`
    pub async fn load(&self, email: &str) -> AppResult<Option<CredentialRecord>> {
        let path = self.credential_path(email);
        let Some(raw) = read_optional(&path).await? else {
            return Ok(None);
        };
        let record: CredentialRecord = serde_json::from_slice(&raw).map_err(|e| {
            AppError::CorruptCredential(format!("{}: {e}", path.display()))
        })?;
        if !record.account_email.eq_ignore_ascii_case(email) {
            return Err(AppError::CorruptCredential(format!(
                "{} holds credentials for '{}'",
                path.display(),
                record.account_email
            )));
        }
        Ok(Some(record))
    }

    /// Atomically write the credential for `record.account_email`
    pub async fn save(&self, record: &CredentialRecord) -> AppResult<()> {
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| AppError::Storage(format!("failed to serialize credential: {e}")))?;
        write_atomic(&self.credential_path(&record.account_email), &bytes).await
    }

    /// Delete the credential for `email`
    ///
    /// Returns `Ok(false)` if there was nothing to delete.
    pub async fn delete(&self, email: &str) -> AppResult<bool> {
        let path = self.credential_path(email);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AppError::Storage(format!(
                "failed to delete {}: {e}",
                path.display()
            ))),
        }
    }

    /// Load the ordered account index; a missing index is an empty registry
    pub async fn load_index(&self) -> AppResult<Vec<AccountEntry>> {
        let path = self.root.join(INDEX_FILE);
        let Some(raw) = read_optional(&path).await? else {
            return Ok(Vec::new());
        };
        let index: IndexFile = serde_json::from_slice(&raw)
            .map_err(|e| AppError::CorruptCredential(format!("{}: {e}", path.display())))?;
        if index.version != INDEX_VERSION {
            tracing::warn!(
                expected = INDEX_VERSION,
                found = index.version,
                "account index version mismatch, loading anyway"
            );
        }
        Ok(index.accounts)
    }

    /// Atomically replace the account index
    pub async fn save_index(&self, entries: &[AccountEntry]) -> AppResult<()> {
        let index = IndexFile {
            version: INDEX_VERSION,
            accounts: entries.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&index)
            .map_err(|e| AppError::Storage(format!("failed to serialize account index: {e}")))?;
        write_atomic(&self.root.join(INDEX_FILE), &bytes).await
    }

    fn credential_path(&self, email: &str) -> PathBuf {
        self.root
            .join(CREDENTIALS_DIR)
            .join(format!("{}.json", file_key(email)))
    }
}

/// Filesystem-safe key for an email address
fn file_key(email: &str) -> String {
    email
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '@' | '+' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

async fn read_optional(path: &Path) -> AppResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::Storage(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// Write to a temp sibling, then rename over `path`
async fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Storage(format!("invalid storage path {}", path.display())))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|e| AppError::Storage(format!("failed to create {}: {e}", parent.display())))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    if let Err(e) = write_synced(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(AppError::Storage(format!(
            "failed to move {} to {}: {e}",
            tmp.display(),
            path.display()
        )));
    }
    sync_dir(parent).await;
    Ok(())
}

/// Write `bytes` to a new file and flush it to disk before returning
async fn write_synced(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let storage_err =
        |e: std::io::Error| AppError::Storage(format!("failed to write {}: {e}", path.display()));
    let mut file = fs::File::create(path).await.map_err(storage_err)?;
    restrict_permissions(path).await?;
    file.write_all(bytes).await.map_err(storage_err)?;
    file.sync_all().await.map_err(storage_err)?;
    Ok(())
}

/// Persist the rename itself; the target is already in place if this fails
async fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        let synced = match fs::File::open(dir).await {
            Ok(handle) => handle.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = synced {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to sync data directory");
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

async fn restrict_permissions(path: &Path) -> AppResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| {
                AppError::Storage(format!(
                    "failed to set permissions on {}: {e}",
                    path.display()
                ))
            })?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
