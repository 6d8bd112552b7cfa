use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::channel::mpsc;

use crate::{
    errors::{MetadataError, Result},
    store::{KeyValue, MetadataStore},
    watch::{WatchEvent, WatchStream},
};

// In-memory provider with the same contract as the etcd backend, including
// session-bound ephemeral keys. Each handle carries a session id; `session()`
// opens a new session over the shared data and `expire_session()` drops all
// keys the session owns, so tests can simulate a broker losing its store
// connection.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
    session_id: u64,
}

#[derive(Debug)]
struct MemoryInner {
    data: DashMap<String, MemoryEntry>,
    watchers: Mutex<Vec<Watcher>>,
    next_session_id: AtomicU64,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    version: i64,
    owner_session: Option<u64>,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    sender: mpsc::UnboundedSender<Result<WatchEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(MemoryInner {
                data: DashMap::new(),
                watchers: Mutex::new(Vec::new()),
                next_session_id: AtomicU64::new(2),
            }),
            session_id: 1,
        }
    }

    // A new session over the same shared data, as if another broker
    // connected to the same store.
    pub fn session(&self) -> Self {
        MemoryStore {
            inner: self.inner.clone(),
            session_id: self.inner.next_session_id.fetch_add(1, Ordering::SeqCst),
        }
    }

    // Drop every ephemeral key owned by this session, as the store would
    // when the session's lease expires.
    pub fn expire_session(&self) {
        let expired: Vec<String> = self
            .inner
            .data
            .iter()
            .filter(|entry| entry.value().owner_session == Some(self.session_id))
            .map(|entry| entry.key().clone())
            .collect();

        for key in expired {
            self.inner.data.remove(&key);
            self.notify(WatchEventKind::Delete, &key, None, 0);
        }
    }

    fn notify(&self, kind: WatchEventKind, key: &str, value: Option<&[u8]>, version: i64) {
        let mut watchers = self
            .inner
            .watchers
            .lock()
            .expect("watcher registry poisoned");
        watchers.retain(|watcher| {
            if !key.starts_with(&watcher.prefix) {
                return true;
            }
            let event = match kind {
                WatchEventKind::Put => WatchEvent::Put {
                    key: key.as_bytes().to_vec(),
                    value: value.unwrap_or_default().to_vec(),
                    mod_revision: None,
                    version: Some(version),
                },
                WatchEventKind::Delete => WatchEvent::Delete {
                    key: key.as_bytes().to_vec(),
                    mod_revision: None,
                    version: Some(version),
                },
            };
            watcher.sender.unbounded_send(Ok(event)).is_ok()
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
enum WatchEventKind {
    Put,
    Delete,
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.data.get(key).map(|entry| entry.value.clone()))
    }

    async fn get_bulk(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        Ok(self
            .inner
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| KeyValue {
                key: entry.key().clone(),
                value: entry.value().value.clone(),
                version: entry.value().version,
            })
            .collect())
    }

    async fn get_childrens(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(self
            .inner
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let version = match self.inner.data.entry(key.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let entry = existing.get_mut();
                entry.value = value.clone();
                entry.version += 1;
                entry.version
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(MemoryEntry {
                    value: value.clone(),
                    version: 1,
                    owner_session: None,
                });
                1
            }
        };
        self.notify(WatchEventKind::Put, key, Some(&value), version);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.inner.data.remove(key).is_some() {
            self.notify(WatchEventKind::Delete, key, None, 0);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.inner.data.contains_key(key))
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let (sender, receiver) = mpsc::unbounded();
        self.inner
            .watchers
            .lock()
            .expect("watcher registry poisoned")
            .push(Watcher {
                prefix: prefix.to_owned(),
                sender,
            });
        Ok(WatchStream::new(receiver))
    }

    async fn create_ephemeral(&self, key: &str, value: Vec<u8>) -> Result<()> {
        // The dashmap entry holds the shard lock, making the
        // check-and-insert atomic across sessions.
        match self.inner.data.entry(key.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(MetadataError::NodeExists(key.to_owned()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(MemoryEntry {
                    value: value.clone(),
                    version: 1,
                    owner_session: Some(self.session_id),
                });
            }
        }
        self.notify(WatchEventKind::Put, key, Some(&value), 1);
        Ok(())
    }

    async fn update_ephemeral(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let version = match self.inner.data.get_mut(key) {
            Some(mut entry) => {
                entry.value = value.clone();
                entry.version += 1;
                entry.version
            }
            None => return Err(MetadataError::NoNode(key.to_owned())),
        };
        self.notify(WatchEventKind::Put, key, Some(&value), version);
        Ok(())
    }
}
