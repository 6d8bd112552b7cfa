use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::error;

use crate::{
    errors::{MetadataError, Result},
    store::{KeyValue, MetadataStore},
    watch::WatchStream,
};
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};

// TTL of the session lease backing the ephemeral keys created through this
// store handle. The keep-alive loop refreshes it at a third of this value.
const SESSION_LEASE_TTL_SECS: i64 = 15;

#[derive(Clone)]
pub struct EtcdStore {
    client: Arc<Mutex<Client>>,
    session_lease: Arc<Mutex<Option<i64>>>,
}

impl EtcdStore {
    pub async fn new(endpoints: Vec<String>) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(MetadataError::from)?;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            session_lease: Arc::new(Mutex::new(None)),
        })
    }

    // Lazily create the session lease and keep it alive in the background.
    // All ephemeral keys created through this handle share the lease, so
    // they all disappear together when the session is lost.
    async fn session_lease_id(&self) -> Result<i64> {
        let mut session = self.session_lease.lock().await;
        if let Some(lease_id) = *session {
            return Ok(lease_id);
        }

        let lease = {
            let mut client = self.client.lock().await;
            client
                .lease_grant(SESSION_LEASE_TTL_SECS, None)
                .await
                .map_err(MetadataError::from)?
        };
        let lease_id = lease.id();
        *session = Some(lease_id);

        let client = self.client.clone();
        let session_slot = self.session_lease.clone();
        tokio::spawn(async move {
            loop {
                let keep_alive = {
                    let mut client = client.lock().await;
                    client.lease_keep_alive(lease_id).await
                };
                match keep_alive {
                    Ok(_) => sleep(Duration::from_secs(SESSION_LEASE_TTL_SECS as u64 / 3)).await,
                    Err(e) => {
                        error!("failed to keep session lease alive: {}", e);
                        *session_slot.lock().await = None;
                        break;
                    }
                }
            }
        });

        Ok(lease_id)
    }
}

#[async_trait]
impl MetadataStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.lock().await;
        let response = client.get(key, None).await.map_err(MetadataError::from)?;
        Ok(response.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn get_bulk(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut client = self.client.lock().await;
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(MetadataError::from)?;

        let mut pairs = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            pairs.push(KeyValue {
                key: kv.key_str()?.to_owned(),
                value: kv.value().to_vec(),
                version: kv.version(),
            });
        }
        Ok(pairs)
    }

    async fn get_childrens(&self, path: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut client = self.client.lock().await;
        let response = client
            .get(
                prefix.as_str(),
                Some(GetOptions::new().with_keys_only().with_prefix()),
            )
            .await
            .map_err(MetadataError::from)?;

        let mut child_paths = Vec::new();
        for kv in response.kvs() {
            child_paths.push(kv.key_str()?.to_owned());
        }
        Ok(child_paths)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut client = self.client.lock().await;
        client
            .put(key, value, None)
            .await
            .map_err(MetadataError::from)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.lock().await;
        client.delete(key, None).await.map_err(MetadataError::from)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut client = self.client.lock().await;
        let response = client
            .get(key, Some(GetOptions::new().with_keys_only()))
            .await
            .map_err(MetadataError::from)?;
        Ok(!response.kvs().is_empty())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let mut client = self.client.lock().await;
        let (_watcher, watch_stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(MetadataError::from)?;
        Ok(WatchStream::from_etcd(watch_stream))
    }

    async fn create_ephemeral(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let lease_id = self.session_lease_id().await?;

        // Transactional create: succeeds only when the key has never been
        // created (or was deleted), which makes the create atomic across
        // concurrently racing sessions.
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )]);

        let response = {
            let mut client = self.client.lock().await;
            client.txn(txn).await.map_err(MetadataError::from)?
        };

        if response.succeeded() {
            Ok(())
        } else {
            Err(MetadataError::NodeExists(key.to_owned()))
        }
    }

    async fn update_ephemeral(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let lease_id = self.session_lease_id().await?;
        let mut client = self.client.lock().await;
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease_id)))
            .await
            .map_err(MetadataError::from)?;
        Ok(())
    }
}

impl Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish()
    }
}
