use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs4::tokio::AsyncFileExt;
use serde_json::Value;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;

use super::KeyValueStore;

/// The main realization of [KeyValueStore]. Each key maps to a `<key>.json` file which is
/// rewritten whole on every set. Documents are tiny, so there is no point in anything
/// smarter than that.
pub struct FileStore {
    store_dir: PathBuf,
}

impl FileStore {
    pub fn new(store_dir: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&store_dir)?;

        Ok(Self { store_dir })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.store_dir.join(format!("{key}.json"))
    }

    async fn read_document(path: &Path) -> Result<Option<Value>> {
        let mut file = match File::open(path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Semi-safe acquire-release for a file
        file.lock_shared()?;
        let result = Self::read_with_file(&mut file, path).await;
        file.unlock_async().await?;
        result.map(Some)
    }

    async fn read_with_file(file: &mut File, path: &Path) -> Result<Value> {
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Corrupted store document {path:?}"))
    }

    async fn write_document(path: &Path, value: &Value) -> Result<()> {
        let mut file = File::options()
            .write(true)
            .create(true)
            .read(true)
            .truncate(false)
            .open(path)
            .await?;

        file.lock_exclusive()?;
        let result = Self::write_with_file(&mut file, value).await;
        file.unlock_async().await?;
        result
    }

    async fn write_with_file(file: &mut File, value: &Value) -> Result<()> {
        file.set_len(0).await?;
        file.rewind().await?;
        file.write_all(&serde_json::to_vec(value)?).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.key_path(key);
        debug!("Reading store document {path:?}");
        Self::read_document(&path).await
    }

    async fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let path = self.key_path(key);
        debug!("Writing store document {path:?}");
        Self::write_document(&path, &value).await
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::daemon::storage::{file_store::FileStore, KeyValueStore, SITE_TIME_KEY};

    #[tokio::test]
    async fn test_file_store_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let mut store = FileStore::new(dir.path().to_owned())?;

        assert_eq!(store.get(SITE_TIME_KEY).await?, None);

        store
            .set(SITE_TIME_KEY, json!({"example.com": 12.5}))
            .await?;

        assert_eq!(
            store.get(SITE_TIME_KEY).await?,
            Some(json!({"example.com": 12.5}))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let mut store = FileStore::new(dir.path().to_owned())?;
        store.set(SITE_TIME_KEY, json!({"a.com": 1.0})).await?;

        let reopened = FileStore::new(dir.path().to_owned())?;
        assert_eq!(reopened.get(SITE_TIME_KEY).await?, Some(json!({"a.com": 1.0})));
        Ok(())
    }

    #[tokio::test]
    async fn test_file_store_overwrites_longer_document() -> Result<()> {
        let dir = tempdir()?;
        let mut store = FileStore::new(dir.path().to_owned())?;
        store
            .set(SITE_TIME_KEY, json!({"a-very-long-domain-name.com": 100.0}))
            .await?;
        store.set(SITE_TIME_KEY, json!({})).await?;

        assert_eq!(store.get(SITE_TIME_KEY).await?, Some(json!({})));
        Ok(())
    }

    #[tokio::test]
    async fn test_file_store_corrupted_document() -> Result<()> {
        let dir = tempdir()?;
        let store = FileStore::new(dir.path().to_owned())?;
        std::fs::write(dir.path().join("siteTime.json"), b"{\"a.com\": ")?;

        assert!(store.get(SITE_TIME_KEY).await.is_err());
        Ok(())
    }

    #[test]
    fn test_file_store_unavailable_directory() -> Result<()> {
        let dir = tempdir()?;
        let blocker = dir.path().join("store");
        std::fs::write(&blocker, b"not a directory")?;

        assert!(FileStore::new(blocker).is_err());
        Ok(())
    }
}
