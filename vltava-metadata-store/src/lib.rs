mod errors;
pub use errors::{MetadataError, Result};

mod store;
pub use store::{KeyValue, MetadataStore};

mod watch;
pub use watch::{WatchEvent, WatchStream};

mod providers;
pub use providers::{etcd::EtcdStore, memory::MemoryStore};

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Etcd(EtcdStore),
    Memory(MemoryStore),
}

#[async_trait]
impl MetadataStore for StorageBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self {
            StorageBackend::Etcd(store) => store.get(key).await,
            StorageBackend::Memory(store) => store.get(key).await,
        }
    }

    async fn get_bulk(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        match self {
            StorageBackend::Etcd(store) => store.get_bulk(prefix).await,
            StorageBackend::Memory(store) => store.get_bulk(prefix).await,
        }
    }

    async fn get_childrens(&self, path: &str) -> Result<Vec<String>> {
        match self {
            StorageBackend::Etcd(store) => store.get_childrens(path).await,
            StorageBackend::Memory(store) => store.get_childrens(path).await,
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        match self {
            StorageBackend::Etcd(store) => store.put(key, value).await,
            StorageBackend::Memory(store) => store.put(key, value).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            StorageBackend::Etcd(store) => store.delete(key).await,
            StorageBackend::Memory(store) => store.delete(key).await,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            StorageBackend::Etcd(store) => store.exists(key).await,
            StorageBackend::Memory(store) => store.exists(key).await,
        }
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        match self {
            StorageBackend::Etcd(store) => store.watch(prefix).await,
            StorageBackend::Memory(store) => store.watch(prefix).await,
        }
    }

    async fn create_ephemeral(&self, key: &str, value: Vec<u8>) -> Result<()> {
        match self {
            StorageBackend::Etcd(store) => store.create_ephemeral(key, value).await,
            StorageBackend::Memory(store) => store.create_ephemeral(key, value).await,
        }
    }

    async fn update_ephemeral(&self, key: &str, value: Vec<u8>) -> Result<()> {
        match self {
            StorageBackend::Etcd(store) => store.update_ephemeral(key, value).await,
            StorageBackend::Memory(store) => store.update_ephemeral(key, value).await,
        }
    }
}
