use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;

/// Where finished playback chunks end up.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_native_storage_roundtrip() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        let path = temp_dir.path().join("nested").join("00000.mp3");
        let path_str = path.to_string_lossy().to_string();

        assert!(!storage.exists(&path_str).await?);
        storage.write(&path_str, b"abc").await?;
        assert!(storage.exists(&path_str).await?);
        assert_eq!(storage.read(&path_str).await?, b"abc");
        assert!(storage.exists(&temp_dir.path().join("nested").to_string_lossy()).await?);
        Ok(())
    }
}
