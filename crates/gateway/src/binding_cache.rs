use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cdc_contracts::LedgerScope;
use tokio::sync::RwLock;

/// Read-mostly tenant → ledger scope cache shared across requests.
#[derive(Clone)]
pub struct BindingCache {
    cache: Arc<RwLock<HashMap<String, CachedBinding>>>,
    max_entries: usize,
    ttl: Duration,
}

#[derive(Clone)]
struct CachedBinding {
    scope: LedgerScope,
    expires_at: Instant,
}

impl BindingCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            max_entries,
            ttl,
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_entries > 0 && self.ttl > Duration::ZERO
    }

    pub async fn get(&self, tenant_id: &str) -> Option<LedgerScope> {
        if !self.enabled() {
            return None;
        }

        let now = Instant::now();
        let cache = self.cache.read().await;
        cache
            .get(tenant_id)
            .and_then(|entry| (entry.expires_at > now).then(|| entry.scope.clone()))
    }

    pub async fn put(&self, tenant_id: &str, scope: LedgerScope) {
        if !self.enabled() {
            return;
        }

        let now = Instant::now();
        let mut cache = self.cache.write().await;

        cache.retain(|_, entry| entry.expires_at > now);
        cache.insert(
            tenant_id.to_string(),
            CachedBinding {
                scope,
                expires_at: now + self.ttl,
            },
        );

        if cache.len() <= self.max_entries {
            return;
        }

        // Evict the entries closest to expiry, never the one just written.
        let mut by_expiry = cache
            .iter()
            .filter(|(key, _)| key.as_str() != tenant_id)
            .map(|(key, entry)| (entry.expires_at, key.clone()))
            .collect::<Vec<_>>();
        by_expiry.sort();
        let overflow = cache.len() - self.max_entries;
        for (_, key) in by_expiry.into_iter().take(overflow) {
            cache.remove(&key);
        }
    }

    pub async fn invalidate(&self, tenant_id: &str) {
        self.cache.write().await.remove(tenant_id);
    }
}
