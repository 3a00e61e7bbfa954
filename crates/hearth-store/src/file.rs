// ABOUTME: Directory-backed DurableStore storing one file per key.
// ABOUTME: Writes go to a per-write temp file, are fsynced, then atomically renamed over the old value.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

use crate::store::{DurableStore, StoreError, check_quota};

/// Stores each key as a file named after the key inside `dir`.
///
/// Keys are limited to ASCII letters, digits, `_`, `-` and `.`, and may not
/// start with `.` (that namespace holds in-progress temp files).
pub struct FileStore {
    dir: PathBuf,
    quota: Option<u64>,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: &Path, quota: Option<u64>) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| io_err("", 0, None, e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            quota,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }

    /// Bytes used by every stored key except `skip`.
    async fn usage_excluding(&self, skip: &str) -> Result<u64, StoreError> {
        let mut used = 0;
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_err(skip, 0, self.quota, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err(skip, 0, self.quota, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name == skip {
                continue;
            }
            let len = entry
                .metadata()
                .await
                .map_err(|e| io_err(skip, 0, self.quota, e))?
                .len();
            used += name.len() as u64 + len;
        }
        Ok(used)
    }
}

fn io_err(key: &str, needed: u64, limit: Option<u64>, err: std::io::Error) -> StoreError {
    match err.kind() {
        ErrorKind::StorageFull | ErrorKind::FileTooLarge => StoreError::QuotaExceeded {
            key: key.to_string(),
            needed,
            limit,
        },
        _ => StoreError::Unavailable(format!("{}: {}", key, err)),
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(key, 0, self.quota, e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let needed = (key.len() + value.len()) as u64;
        if self.quota.is_some() {
            let used = self.usage_excluding(key).await?;
            check_quota(self.quota, key, value, used)?;
        }

        // Each write gets its own temp file so concurrent writers of one key
        // never share a partially written file.
        let tmp_path = self.dir.join(format!(".{}.{}.tmp", key, Ulid::new()));
        let write = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(value.as_bytes()).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp_path, &path).await
        };

        if let Err(e) = write.await {
            // Best-effort: the temp file is invisible to readers either way.
            let _ = fs::remove_file(&tmp_path).await;
            return Err(io_err(key, needed, self.quota, e));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(key, 0, self.quota, e)),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_err(prefix, 0, self.quota, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err(prefix, 0, self.quota, e))?
        {
            if let Some(name) = entry.file_name().to_str()
                && !name.starts_with('.')
                && name.starts_with(prefix)
            {
                keys.push(name.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}
