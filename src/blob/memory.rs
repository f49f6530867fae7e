//! In-memory blob store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BlobError, BlobKey, BlobResult, BlobStore};

#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    objects: Arc<RwLock<BTreeMap<BlobKey, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &BlobKey, bytes: Vec<u8>) -> BlobResult<()> {
        key.validate()?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Err(BlobError::AlreadyExists(key.path()));
        }
        objects.insert(key.clone(), bytes);
        Ok(())
    }

    async fn get(&self, key: &BlobKey) -> BlobResult<Option<Vec<u8>>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> BlobResult<Vec<BlobKey>> {
        let objects = self.objects.read().await;
        let mut keys: Vec<BlobKey> = objects
            .keys()
            .filter(|k| k.path().starts_with(prefix))
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.path());
        Ok(keys)
    }
}
