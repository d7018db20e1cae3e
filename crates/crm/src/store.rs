use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// OAuth credential pair persisted between runs so a restart never forces a
/// fresh browser authorization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl StoredCredentials {
    /// True when the access token expires within `buffer` of `now`.
    pub fn expires_within(&self, buffer: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + buffer
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not read credential file `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("could not parse credential file `{path}`: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("could not serialize credentials: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("could not write credential file `{path}`: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("could not replace credential file `{path}`: {source}")]
    Replace { path: PathBuf, source: std::io::Error },
}

/// Stores credentials as JSON on disk. Writes go to a temporary sibling file
/// first and are renamed into place, so a crash mid-write never leaves a
/// truncated credential file behind.
#[derive(Clone, Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<StoredCredentials>, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Read { path: self.path.clone(), source }),
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Parse { path: self.path.clone(), source })
    }

    pub async fn persist(&self, credentials: &StoredCredentials) -> Result<(), StoreError> {
        let serialized = serde_json::to_string_pretty(credentials).map_err(StoreError::Encode)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::Write { path: parent.to_path_buf(), source })?;
            }
        }

        // The temp file sits next to the target so the rename stays on one
        // filesystem and remains atomic.
        let staging = self.path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&staging, serialized)
            .await
            .map_err(|source| StoreError::Write { path: staging.clone(), source })?;

        if let Err(source) = tokio::fs::rename(&staging, &self.path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(StoreError::Replace { path: self.path.clone(), source });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    use super::{FileCredentialStore, StoredCredentials};

    fn credentials(access: &str) -> StoredCredentials {
        StoredCredentials {
            access_token: access.to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time"),
        }
    }

    #[tokio::test]
    async fn load_returns_none_when_file_is_missing() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileCredentialStore::new(dir.path().join("tokens.json"));

        let loaded = store.load().await.expect("load should succeed");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileCredentialStore::new(dir.path().join("tokens.json"));

        let original = credentials("access-1");
        store.persist(&original).await.expect("persist should succeed");

        let loaded = store.load().await.expect("load should succeed");
        assert_eq!(loaded, Some(original));
    }

    #[tokio::test]
    async fn persist_replaces_existing_file_without_leaving_temp_files() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileCredentialStore::new(dir.path().join("tokens.json"));

        store.persist(&credentials("access-1")).await.expect("first persist");
        store.persist(&credentials("access-2")).await.expect("second persist");

        let loaded = store.load().await.expect("load should succeed").expect("file exists");
        assert_eq!(loaded.access_token, "access-2");

        let mut entries = std::fs::read_dir(dir.path())
            .expect("read dir")
            .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        entries.sort();
        assert_eq!(entries, vec!["tokens.json".to_string()]);
    }

    #[tokio::test]
    async fn persist_creates_missing_parent_directories() {
        let dir = TempDir::new().expect("temp dir");
        let store = FileCredentialStore::new(dir.path().join("nested/state/tokens.json"));

        store.persist(&credentials("access-1")).await.expect("persist should succeed");
        assert!(store.load().await.expect("load should succeed").is_some());
    }

    #[test]
    fn expiry_window_includes_the_boundary() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 11, 55, 0).single().expect("valid time");
        let creds = credentials("access-1");

        assert!(creds.expires_within(Duration::minutes(5), now));
        assert!(!creds.expires_within(Duration::minutes(4), now));
    }
}
