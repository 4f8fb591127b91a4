//! Credential file implementation.

use crate::error::{AuthError, AuthResult};
use crate::record::{CredentialRecord, InvalidateScope};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// File-backed store for the credential record.
///
/// Every mutation reads the whole record, modifies it and writes it back.
/// Writes within one process are serialized; across processes the last
/// writer wins, and each write replaces the file atomically.
pub struct CredentialStore {
    /// Path to the credential file.
    path: PathBuf,
    /// Serializes load-modify-save cycles within this process.
    write_lock: Mutex<()>,
}

impl CredentialStore {
    /// Create a credential store using the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn new() -> AuthResult<Self> {
        let path = crate::default_credentials_path().ok_or(AuthError::NoHomeDir)?;
        Ok(Self::with_path(path))
    }

    /// Create a credential store with a custom path.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Get the path to the credential file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored record.
    ///
    /// A missing, empty or unparsable file yields an empty record.
    pub async fn load(&self) -> CredentialRecord {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "No stored credentials, starting fresh");
                return CredentialRecord::default();
            }
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Could not read credential file");
                return CredentialRecord::default();
            }
        };

        if content.trim().is_empty() {
            return CredentialRecord::default();
        }

        match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Ignoring unparsable credential file");
                CredentialRecord::default()
            }
        }
    }

    /// Replace the stored record.
    pub async fn save(&self, record: &CredentialRecord) -> AuthResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write(record).await
    }

    /// Apply `mutate` to the stored record and persist the result.
    ///
    /// Returns the record as written.
    pub async fn update<F>(&self, mutate: F) -> AuthResult<CredentialRecord>
    where
        F: FnOnce(&mut CredentialRecord),
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load().await;
        mutate(&mut record);
        self.write(&record).await?;
        Ok(record)
    }

    /// Discard part of the stored record and persist immediately.
    pub async fn invalidate(&self, scope: InvalidateScope) -> AuthResult<()> {
        debug!(scope = %scope, "Invalidating stored credentials");
        self.update(|record| record.invalidate(scope)).await?;
        Ok(())
    }

    /// Write the record to a sibling temp file, then rename it into place.
    async fn write(&self, record: &CredentialRecord) -> AuthResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(record)?;
        let tmp_path = self.temp_path();

        write_private(&tmp_path, content.as_bytes()).await?;

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!(path = ?self.path, "Wrote credential file");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

/// Write `bytes` to `path` readable only by the owner where supported.
async fn write_private(path: &Path, bytes: &[u8]) -> AuthResult<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;

    // The mode above only applies to newly created files.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms).await.map_err(|e| {
            AuthError::Permissions(format!("Failed to set permissions on {:?}: {}", path, e))
        })?;
    }

    Ok(())
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .finish()
    }
}
