use anyhow::{anyhow, Result};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use vltava_metadata_store::{MetadataError, MetadataStore, StorageBackend};

use crate::resources::{join_path, BASE_NAMESPACE_OWNER_PATH};
use crate::service_configuration::ServiceConfiguration;
use crate::service_unit::ServiceUnitId;

// The ephemeral record published at /namespace/<bundle> by the owning
// broker. disabled=true signals a graceful handover in progress: the owner
// still holds the lock but refuses new traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceEphemeralData {
    pub native_url: String,
    pub native_url_tls: Option<String>,
    pub http_url: String,
    pub http_url_tls: Option<String>,
    pub disabled: bool,
}

// A service unit owned by the local broker. active=false means traffic has
// been disabled while the coordination-store lock is still held.
#[derive(Debug, Clone)]
pub struct OwnedBundle {
    bundle: ServiceUnitId,
    active: Arc<AtomicBool>,
}

impl OwnedBundle {
    fn new(bundle: ServiceUnitId) -> Self {
        OwnedBundle {
            bundle,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn bundle(&self) -> &ServiceUnitId {
        &self.bundle
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

// Why an acquisition failed. Cloneable so every caller sharing the in-flight
// future sees the same outcome.
#[derive(Debug, Clone)]
enum AcquireError {
    NodeExists(String),
    Store(Arc<MetadataError>),
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::NodeExists(path) => write!(f, "already owned: {}", path),
            AcquireError::Store(error) => write!(f, "{}", error),
        }
    }
}

type AcquireFuture = Shared<BoxFuture<'static, std::result::Result<OwnedBundle, AcquireError>>>;

// Ownership acquisition and lookup for service units. The atomic create of
// the ephemeral node is the mutex: whichever broker's create lands first
// owns the bundle until its session ends.
//
// owned_bundles is a keyed promise map: the entry for a path is inserted
// synchronously, so concurrent acquirers of the same bundle share a single
// in-flight create. A failed acquisition removes its entry so the next
// caller retries. Paths present in owned_bundles are never answered from
// the remote read-only cache.
pub struct OwnershipCache {
    store: StorageBackend,
    self_owner_info: NamespaceEphemeralData,
    self_owner_info_disabled: NamespaceEphemeralData,
    owned_bundles: Arc<DashMap<String, AcquireFuture>>,
    ownership_read_only_cache: Arc<DashMap<String, NamespaceEphemeralData>>,
}

impl OwnershipCache {
    pub fn new(store: StorageBackend, config: &ServiceConfiguration) -> Self {
        let self_owner_info = NamespaceEphemeralData {
            native_url: config.broker_service_url.clone(),
            native_url_tls: config.broker_service_url_tls.clone(),
            http_url: config.web_service_url.clone(),
            http_url_tls: config.web_service_url_tls.clone(),
            disabled: false,
        };
        let self_owner_info_disabled = NamespaceEphemeralData {
            disabled: true,
            ..self_owner_info.clone()
        };

        OwnershipCache {
            store,
            self_owner_info,
            self_owner_info_disabled,
            owned_bundles: Arc::new(DashMap::new()),
            ownership_read_only_cache: Arc::new(DashMap::new()),
        }
    }

    fn path_for(bundle: &ServiceUnitId) -> String {
        join_path(&[BASE_NAMESPACE_OWNER_PATH, bundle.as_str()])
    }

    pub fn self_owner_info(&self) -> &NamespaceEphemeralData {
        &self.self_owner_info
    }

    // Attempt to take ownership of the bundle. Resolves with the winning
    // owner's info: our own on success, the concurrent winner's when the
    // node already exists.
    pub async fn try_acquire_ownership(
        &self,
        bundle: &ServiceUnitId,
    ) -> Result<NamespaceEphemeralData> {
        let path = Self::path_for(bundle);

        let acquisition = match self.owned_bundles.entry(path.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                // a lingering failed acquisition does not satisfy anyone;
                // start over in its place
                let failed = entry
                    .get()
                    .peek()
                    .map(|result| result.is_err())
                    .unwrap_or(false);
                if failed {
                    let future = self.acquire_future(path.clone(), bundle.clone());
                    entry.insert(future.clone());
                    tokio::spawn(future.clone().map(|_| ()));
                    future
                } else {
                    entry.get().clone()
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!("trying to acquire ownership of {}", bundle);
                let future = self.acquire_future(path.clone(), bundle.clone());
                slot.insert(future.clone());
                // drive the create to completion even if every caller
                // goes away mid-acquisition
                tokio::spawn(future.clone().map(|_| ()));
                future
            }
        };

        match acquisition.clone().await {
            Ok(_) => {
                debug!("successfully acquired ownership of {}", path);
                self.ownership_read_only_cache.remove(&path);
                Ok(self.self_owner_info.clone())
            }
            Err(error) => {
                // the failed future must not satisfy future lookups
                self.owned_bundles
                    .remove_if(&path, |_, pending| pending.ptr_eq(&acquisition));

                match &error {
                    AcquireError::NodeExists(_) => {
                        info!(
                            "failed to acquire ownership of {} - already owned by another broker",
                            path
                        );
                        match self.read_remote_owner(&path).await {
                            Ok(Some(owner)) => Ok(owner),
                            // the node vanished between our create failing
                            // and the read; surface the original failure
                            Ok(None) => {
                                Err(anyhow!("failed to acquire ownership of {}: {}", path, error))
                            }
                            Err(read_error) => {
                                warn!("failed to check ownership of {}: {}", path, read_error);
                                Err(anyhow!("failed to acquire ownership of {}: {}", path, error))
                            }
                        }
                    }
                    AcquireError::Store(store_error) => {
                        warn!("failed to acquire ownership of {}: {}", path, store_error);
                        Err(anyhow!(
                            "failed to acquire ownership of {}: {}",
                            path,
                            store_error
                        ))
                    }
                }
            }
        }
    }

    fn acquire_future(&self, path: String, bundle: ServiceUnitId) -> AcquireFuture {
        let store = self.store.clone();
        let payload = serde_json::to_vec(&self.self_owner_info);

        async move {
            let payload = payload
                .map_err(|e| AcquireError::Store(Arc::new(MetadataError::SerializationError(e))))?;
            match store.create_ephemeral(&path, payload).await {
                Ok(()) => {
                    debug!("acquired lock on {}", path);
                    Ok(OwnedBundle::new(bundle))
                }
                Err(MetadataError::NodeExists(existing)) => {
                    Err(AcquireError::NodeExists(existing))
                }
                Err(error) => Err(AcquireError::Store(Arc::new(error))),
            }
        }
        .boxed()
        .shared()
    }

    // Current owner of the bundle: the local broker when the bundle is in
    // the local map (even while the acquisition is still in flight),
    // otherwise whatever the remote ephemeral node says.
    pub async fn get_owner(
        &self,
        bundle: &ServiceUnitId,
    ) -> Result<Option<NamespaceEphemeralData>> {
        let path = Self::path_for(bundle);

        let pending = self
            .owned_bundles
            .get(&path)
            .map(|entry| entry.value().clone());
        if let Some(acquisition) = pending {
            if let Ok(owned) = acquisition.await {
                let info = if owned.is_active() {
                    self.self_owner_info.clone()
                } else {
                    self.self_owner_info_disabled.clone()
                };
                return Ok(Some(info));
            }
            // failed acquisition: fall through to the remote view
        }

        Ok(self.read_remote_owner(&path).await?)
    }

    async fn read_remote_owner(
        &self,
        path: &str,
    ) -> std::result::Result<Option<NamespaceEphemeralData>, MetadataError> {
        if let Some(cached) = self.ownership_read_only_cache.get(path) {
            return Ok(Some(cached.clone()));
        }

        match self.store.get(path).await? {
            Some(bytes) => {
                let owner: NamespaceEphemeralData = serde_json::from_slice(&bytes)?;
                self.ownership_read_only_cache
                    .insert(path.to_owned(), owner.clone());
                Ok(Some(owner))
            }
            None => Ok(None),
        }
    }

    // Drop ownership of the bundle. The local cache stops reporting
    // ownership before this returns; the ephemeral node delete runs
    // asynchronously and is idempotent, since the node expires with the
    // session anyway.
    pub fn remove_ownership(&self, bundle: &ServiceUnitId) {
        let path = Self::path_for(bundle);
        if self.owned_bundles.remove(&path).is_some() {
            info!("removing ownership for {}", path);
            let store = self.store.clone();
            let read_only_cache = self.ownership_read_only_cache.clone();
            tokio::spawn(async move {
                if let Err(error) = store.delete(&path).await {
                    warn!("failed to delete ownership node {}: {}", path, error);
                }
                read_only_cache.remove(&path);
            });
        }
    }

    pub fn remove_all_ownership(&self, bundles: &[ServiceUnitId]) {
        for bundle in bundles {
            self.remove_ownership(bundle);
        }
    }

    // Stop taking traffic for the bundle while keeping the lock: flip the
    // local flag, then overwrite the ephemeral node with the disabled
    // payload so other brokers refetch it.
    pub async fn disable_ownership(&self, bundle: &ServiceUnitId) -> Result<()> {
        let path = Self::path_for(bundle);

        if let Some(entry) = self.owned_bundles.get(&path) {
            if let Some(Ok(owned)) = entry.value().peek() {
                owned.set_active(false);
            }
        }

        let payload = serde_json::to_vec(&self.self_owner_info_disabled)?;
        self.store.update_ephemeral(&path, payload).await?;
        self.ownership_read_only_cache.remove(&path);
        Ok(())
    }

    // Locally owned bundles whose acquisition has completed. Does not block.
    pub fn owned_bundles(&self) -> HashMap<String, OwnedBundle> {
        self.owned_bundles
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .peek()
                    .and_then(|result| result.as_ref().ok())
                    .map(|owned| (entry.key().clone(), owned.clone()))
            })
            .collect()
    }

    pub fn get_owned_bundle(&self, bundle: &ServiceUnitId) -> Option<OwnedBundle> {
        let path = Self::path_for(bundle);
        self.owned_bundles.get(&path).and_then(|entry| {
            entry
                .value()
                .peek()
                .and_then(|result| result.as_ref().ok())
                .cloned()
        })
    }

    pub fn is_bundle_owned(&self, bundle: &ServiceUnitId) -> bool {
        self.get_owned_bundle(bundle)
            .map(|owned| owned.is_active())
            .unwrap_or(false)
    }
}

impl fmt::Debug for OwnershipCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnershipCache")
            .field("owner", &self.self_owner_info.native_url)
            .field("owned_bundles", &self.owned_bundles.len())
            .finish()
    }
}
