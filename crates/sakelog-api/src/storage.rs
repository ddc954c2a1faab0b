use std::fmt::Debug;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use uuid::Uuid;

const CATEGORY_PREFIX: &str = "categories";

/// Destination for uploaded category images.
pub trait ObjectStorage: Debug + Send + Sync {
    /// Persist `bytes` under a fresh key and return the public URL.
    ///
    /// # Errors
    /// Returns an error when the object cannot be written.
    fn upload(&self, bytes: &[u8], content_type: &str, extension: &str) -> Result<String>;
}

/// Writes objects below a local directory that is served at `public_base_url`.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStorage {
    #[must_use]
    pub fn new(root: PathBuf, public_base_url: impl Into<String>) -> Self {
        let public_base_url = public_base_url.into().trim_end_matches('/').to_string();
        Self { root, public_base_url }
    }
}

impl ObjectStorage for LocalObjectStorage {
    fn upload(&self, bytes: &[u8], content_type: &str, extension: &str) -> Result<String> {
        let dir = self.root.join(CATEGORY_PREFIX);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create object directory {}", dir.display()))?;

        let key = format!("{}.{extension}", Uuid::new_v4());
        let path = dir.join(&key);
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write object {}", path.display()))?;

        tracing::debug!(
            object = %path.display(),
            content_type,
            size = bytes.len(),
            "stored object"
        );
        Ok(format!("{}/{CATEGORY_PREFIX}/{key}", self.public_base_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_storage_writes_under_prefix_and_returns_public_url() -> Result<()> {
        let root = std::env::temp_dir().join(format!("sakelog-objects-{}", ulid::Ulid::new()));
        let storage = LocalObjectStorage::new(root.clone(), "https://cdn.example/assets/");

        let url = storage.upload(b"payload", "image/png", "png")?;
        let Some(key) = url.strip_prefix("https://cdn.example/assets/categories/") else {
            panic!("unexpected url shape: {url}");
        };
        assert!(key.ends_with(".png"));
        assert_eq!(fs::read(root.join(CATEGORY_PREFIX).join(key))?, b"payload");

        let second = storage.upload(b"payload", "image/png", "png")?;
        assert_ne!(url, second);

        fs::remove_dir_all(&root)?;
        Ok(())
    }
}
