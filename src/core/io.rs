use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

/// File access used by the cache and the checkpoint manager.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn copy(&self, from: &str, to: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

async fn ensure_parent(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    /// Writes through a sibling temp file and a rename so readers never see
    /// a half-written file.
    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        ensure_parent(path).await?;
        let tmp = format!("{}.tmp", path);
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            if Path::new(path).is_dir() {
                tokio::fs::remove_dir_all(path).await?;
            } else {
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = Path::new(prefix);
        let mut entries = Vec::new();

        if tokio::fs::try_exists(path).await? {
            if path.is_dir() {
                let mut dir = tokio::fs::read_dir(path).await?;
                while let Some(entry) = dir.next_entry().await? {
                    entries.push(entry.path().to_string_lossy().to_string());
                }
            } else {
                entries.push(prefix.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        ensure_parent(to).await?;
        tokio::fs::copy(from, to).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_parents_and_lists_sorted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("nested");
        let root_str = root.to_string_lossy().to_string();
        let storage = NativeStorage::new();

        storage.write(&format!("{}/b.json", root_str), b"b").await?;
        storage.write(&format!("{}/a.json", root_str), b"a").await?;

        let listed = storage.list(&root_str).await?;
        assert_eq!(listed.len(), 2);
        assert!(listed[0].ends_with("a.json"));
        assert!(!listed.iter().any(|p| p.ends_with(".tmp")));

        storage
            .copy(&format!("{}/a.json", root_str), &format!("{}/c/a.json", root_str))
            .await?;
        assert_eq!(storage.read(&format!("{}/c/a.json", root_str)).await?, b"a");

        storage.delete(&format!("{}/c", root_str)).await?;
        assert!(!storage.exists(&format!("{}/c", root_str)).await?);
        assert!(storage.list(&format!("{}/missing", root_str)).await?.is_empty());
        Ok(())
    }
}
