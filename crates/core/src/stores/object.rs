use crate::error::StoreError;
use crate::traits::ObjectStore;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Hex SHA-256 of the content, used as both content hash and object locator.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn validate_locator(locator: &str) -> Result<(), StoreError> {
    if locator.len() == 64 && locator.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(StoreError::NotFound(format!("object {locator}")))
    }
}

/// Content-addressed files under `root/<2 hex>/<hash>`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, locator: &str) -> PathBuf {
        self.root.join(&locator[..2]).join(locator)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let locator = content_hash(bytes);
        let path = self.path_for(&locator);
        if tokio::fs::try_exists(&path).await? {
            return Ok(locator);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so a crash never leaves a truncated object.
        let staging = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &path).await?;

        Ok(locator)
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>, StoreError> {
        validate_locator(locator)?;
        match tokio::fs::read(self.path_for(locator)).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("object {locator}")))
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let locator = content_hash(bytes);
        self.objects
            .write()
            .await
            .entry(locator.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(locator)
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .await
            .get(locator)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("object {locator}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filesystem_objects_are_content_addressed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        let first = store.put(b"quarterly refund policy").await.expect("put");
        let second = store.put(b"quarterly refund policy").await.expect("put");

        assert_eq!(first, second);
        assert_eq!(first, content_hash(b"quarterly refund policy"));
        assert_eq!(store.get(&first).await.expect("get"), b"quarterly refund policy");
    }

    #[tokio::test]
    async fn unknown_or_malformed_locators_are_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        assert!(matches!(store.get("../etc/passwd").await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.get(&content_hash(b"never stored")).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
