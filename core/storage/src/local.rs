//! Local filesystem storage engine.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::engine::{validate_table_name, StorageEngine};
use sehatlink_common::{Error, Result};

const TABLE_EXTENSION: &str = "json";

/// Local filesystem storage engine.
///
/// Each table is stored as `<root>/<table>.json`. Writes go to a temporary
/// file that is renamed over the table, so readers see either the old or the
/// new table and never a torn one. The temporary file is flushed to disk
/// before the rename so a crash cannot leave an empty table behind.
pub struct LocalEngine {
    root: PathBuf,
}

impl LocalEngine {
    /// Create a new local engine with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - `StorageUnavailable` if the directory cannot be created
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root).map_err(|e| unavailable(&root, e))?;
        }
        if !root.is_dir() {
            return Err(Error::StorageUnavailable(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        Ok(Self { root })
    }

    /// Root directory of this engine.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(format!("{}.{}", table, TABLE_EXTENSION))
    }
}

async fn write_durable(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

fn unavailable(path: &Path, err: std::io::Error) -> Error {
    Error::StorageUnavailable(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl StorageEngine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    async fn read_table(&self, table: &str) -> Result<Option<Vec<u8>>> {
        validate_table_name(table)?;
        let path = self.table_path(table);

        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(&path, e)),
        }
    }

    async fn write_table(&self, table: &str, data: Vec<u8>) -> Result<()> {
        validate_table_name(table)?;
        let path = self.table_path(table);
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", table, Uuid::new_v4()));

        if let Err(e) = write_durable(&tmp, &data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(unavailable(&tmp, e));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(unavailable(&path, e));
        }

        debug!(table, bytes = data.len(), "Table written");
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| unavailable(&self.root, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable(&self.root, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TABLE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_table_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read() {
        let temp = TempDir::new().unwrap();
        let engine = LocalEngine::new(temp.path()).unwrap();

        engine
            .write_table("reminders", b"[{\"id\":\"r1\"}]".to_vec())
            .await
            .unwrap();

        let data = engine.read_table("reminders").await.unwrap().unwrap();
        assert_eq!(data, b"[{\"id\":\"r1\"}]".to_vec());
        assert!(temp.path().join("reminders.json").exists());
    }

    #[tokio::test]
    async fn test_missing_table_is_none() {
        let temp = TempDir::new().unwrap();
        let engine = LocalEngine::new(temp.path()).unwrap();
        assert_eq!(engine.read_table("nutrition").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let engine = LocalEngine::new(temp.path()).unwrap();

        engine.write_table("offline_data", b"[1]".to_vec()).await.unwrap();
        engine.write_table("offline_data", b"[2]".to_vec()).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(
            engine.read_table("offline_data").await.unwrap(),
            Some(b"[2]".to_vec())
        );
    }

    #[tokio::test]
    async fn test_durable_write_contents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("scratch.json");
        write_durable(&path, b"[{\"id\":\"n1\"}]").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"[{\"id\":\"n1\"}]".to_vec());

        let missing_dir = temp.path().join("gone").join("scratch.json");
        assert!(write_durable(&missing_dir, b"[]").await.is_err());
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let temp = TempDir::new().unwrap();
        {
            let engine = LocalEngine::new(temp.path()).unwrap();
            engine.write_table("reminders", b"[]".to_vec()).await.unwrap();
        }
        let engine = LocalEngine::new(temp.path()).unwrap();
        assert_eq!(engine.list_tables().await.unwrap(), vec!["reminders".to_string()]);
    }

    #[test]
    fn test_root_must_be_directory() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("plain-file");
        std::fs::write(&file, b"x").unwrap();

        let err = LocalEngine::new(&file).err().unwrap();
        assert!(matches!(err, Error::StorageUnavailable(_)));
    }
}
