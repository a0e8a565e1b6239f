use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use super::uri::StorageUri;
use super::{ObjectStore, StorageError, UploadOptions};

/// In-process bucket for tests.
#[derive(Default)]
pub struct MemoryStore {
    objects: RefCell<HashMap<String, Vec<u8>>>,
    pub fail_uploads: Cell<bool>,
    pub downloads: Cell<usize>,
}

impl MemoryStore {
    pub fn remove(&self, uri: &str) -> Option<Vec<u8>> {
        self.objects.borrow_mut().remove(uri)
    }

    pub fn put(&self, uri: &str, data: Vec<u8>) {
        self.objects.borrow_mut().insert(uri.to_string(), data);
    }

    pub fn get(&self, uri: &str) -> Option<Vec<u8>> {
        self.objects.borrow().get(uri).cloned()
    }
}

impl ObjectStore for MemoryStore {
    async fn exists(&self, uri: &StorageUri) -> Result<bool, StorageError> {
        Ok(self.objects.borrow().contains_key(&uri.to_string()))
    }

    async fn download(&self, uri: &StorageUri) -> Result<Vec<u8>, StorageError> {
        self.downloads.set(self.downloads.get() + 1);
        self.get(&uri.to_string())
            .ok_or_else(|| StorageError::NotFound(uri.to_string()))
    }

    async fn upload(
        &self,
        data: &[u8],
        uri: &StorageUri,
        _options: &UploadOptions,
    ) -> Result<(), StorageError> {
        if self.fail_uploads.get() {
            return Err(StorageError::S3("injected upload failure".into()));
        }
        self.put(&uri.to_string(), data.to_vec());
        Ok(())
    }
}
