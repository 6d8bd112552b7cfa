use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

// The admin surface of a broker, as far as the load balancer needs it: ask a
// broker to release a bundle, or to split one. Implemented elsewhere against
// the broker's admin RPC endpoint.
#[async_trait]
pub trait BrokerAdmin: Send + Sync + 'static {
    async fn unload_namespace_bundle(&self, namespace: &str, bundle_range: &str) -> Result<()>;
    async fn split_namespace_bundle(&self, namespace: &str, bundle_range: &str) -> Result<()>;
}

pub type BrokerAdminFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn BrokerAdmin>> + Send + Sync + 'static>;

const ADMIN_CLIENT_IDLE_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

// One admin client per target broker URL, created lazily and dropped again
// after a day without use.
pub struct AdminClientCache {
    factory: BrokerAdminFactory,
    clients: DashMap<String, (Arc<dyn BrokerAdmin>, Instant)>,
}

impl AdminClientCache {
    pub fn new(factory: BrokerAdminFactory) -> Self {
        AdminClientCache {
            factory,
            clients: DashMap::new(),
        }
    }

    pub fn get(&self, broker_url: &str) -> Result<Arc<dyn BrokerAdmin>> {
        let now = Instant::now();
        self.clients
            .retain(|_, (_, last_used)| now.duration_since(*last_used) < ADMIN_CLIENT_IDLE_EXPIRY);

        if let Some(mut entry) = self.clients.get_mut(broker_url) {
            entry.1 = now;
            return Ok(entry.0.clone());
        }

        let client = (self.factory)(broker_url)?;
        self.clients
            .insert(broker_url.to_owned(), (client.clone(), now));
        Ok(client)
    }
}

impl std::fmt::Debug for AdminClientCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminClientCache")
            .field("clients", &self.clients.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopAdmin;

    #[async_trait]
    impl BrokerAdmin for NoopAdmin {
        async fn unload_namespace_bundle(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn split_namespace_bundle(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_clients_are_reused_per_broker() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let cache = AdminClientCache::new(Arc::new(move |_url| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopAdmin) as Arc<dyn BrokerAdmin>)
        }));

        cache.get("http://broker-a:8080").unwrap();
        cache.get("http://broker-a:8080").unwrap();
        cache.get("http://broker-b:8080").unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 2);
    }
}
