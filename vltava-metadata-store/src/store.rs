use async_trait::async_trait;

use crate::{errors::Result, watch::WatchStream};

// A key/value pair together with the store-side version of the key,
// as returned by bulk reads.
#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub version: i64,
}

#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    // All key/value pairs whose key starts with the given prefix.
    async fn get_bulk(&self, prefix: &str) -> Result<Vec<KeyValue>>;
    // The keys that are children of the given path.
    async fn get_childrens(&self, path: &str) -> Result<Vec<String>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;
    // Atomic create of a key bound to this store handle's session.
    // The key disappears when the session ends. Fails with
    // MetadataError::NodeExists when any session already holds the key.
    async fn create_ephemeral(&self, key: &str, value: Vec<u8>) -> Result<()>;
    // Overwrite the data of an ephemeral key, keeping it bound to the
    // same session.
    async fn update_ephemeral(&self, key: &str, value: Vec<u8>) -> Result<()>;
}
