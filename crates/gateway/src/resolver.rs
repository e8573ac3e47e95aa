use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use cdc_contracts::{LedgerScope, Payload, SourceTag};
use cdc_ledger::{BindingLookup, LedgerBinding, LedgerError};
use cdc_merge::rows::parse_i64;
use chrono::Utc;

use crate::binding_cache::BindingCache;
use crate::executor::{Executor, SourceFailure};

#[derive(Debug)]
pub enum ResolveError {
    NotBound,
    Unavailable(LedgerError),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::NotBound => write!(f, "tenant has no ledger binding"),
            ResolveError::Unavailable(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ResolveError {}

#[derive(Debug)]
pub enum RefreshError {
    SourcesUnavailable(Vec<SourceFailure>),
    Store(LedgerError),
}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshError::SourcesUnavailable(failures) => {
                write!(f, "no source answered the ledger lookup")?;
                for failure in failures {
                    write!(f, "; {}: {}", failure.source, failure.message)?;
                }
                Ok(())
            }
            RefreshError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for RefreshError {}

/// Tenant → ledger scope lookups, cached in front of the binding store.
#[derive(Clone)]
pub struct BindingResolver {
    store: Arc<dyn BindingLookup>,
    cache: BindingCache,
    timeout: Duration,
}

impl BindingResolver {
    pub fn new(store: Arc<dyn BindingLookup>, cache: BindingCache, timeout: Duration) -> Self {
        Self {
            store,
            cache,
            timeout,
        }
    }

    pub async fn resolve(&self, tenant_id: &str) -> Result<LedgerScope, ResolveError> {
        if let Some(scope) = self.cache.get(tenant_id).await {
            return Ok(scope);
        }

        let binding = tokio::time::timeout(self.timeout, self.store.find_binding(tenant_id))
            .await
            .map_err(|_| ResolveError::Unavailable(LedgerError::Timeout))?
            .map_err(ResolveError::Unavailable)?
            .ok_or(ResolveError::NotBound)?;

        self.cache.put(tenant_id, binding.scope.clone()).await;
        Ok(binding.scope)
    }

    /// Re-reads the tenant's ledgers from both sources and replaces the
    /// stored binding. A source that fails contributes no ledgers; the
    /// refresh fails only when neither source answers.
    pub async fn refresh(
        &self,
        executor: &Executor,
        tenant_id: &str,
        customer_key: Option<&str>,
    ) -> Result<(LedgerBinding, Vec<SourceFailure>), RefreshError> {
        let email = tenant_id.trim().to_lowercase();
        let (a, b) = tokio::join!(
            executor.validate_email_key(SourceTag::A, &email, customer_key),
            executor.validate_email_key(SourceTag::B, &email, customer_key),
        );

        let mut failures = Vec::new();
        let a = a.unwrap_or_else(|failure| {
            failures.push(failure);
            Vec::new()
        });
        let b = b.unwrap_or_else(|failure| {
            failures.push(failure);
            Vec::new()
        });
        if failures.len() == SourceTag::ALL.len() {
            return Err(RefreshError::SourcesUnavailable(failures));
        }

        let (source_a, source_a_names) = extract_ledgers(&a);
        let (source_b, source_b_names) = extract_ledgers(&b);
        let binding = LedgerBinding {
            tenant_id: tenant_id.to_string(),
            scope: LedgerScope { source_a, source_b },
            source_a_names,
            source_b_names,
            refreshed_at: Some(Utc::now()),
        };

        tokio::time::timeout(self.timeout, self.store.upsert_binding(&binding))
            .await
            .map_err(|_| RefreshError::Store(LedgerError::Timeout))?
            .map_err(RefreshError::Store)?;
        self.cache.invalidate(tenant_id).await;

        tracing::info!(
            tenant_id,
            source_a_ledgers = binding.scope.source_a.len(),
            source_b_ledgers = binding.scope.source_b.len(),
            failed_sources = failures.len(),
            "gateway.bindings_refreshed"
        );
        Ok((binding, failures))
    }

    pub async fn ping(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, self.store.ping()).await,
            Ok(Ok(()))
        )
    }
}

/// Unique `LedgerID`s in id order, with the first `LedgerName` seen for each.
fn extract_ledgers(rows: &[Payload]) -> (BTreeSet<i32>, Vec<String>) {
    let mut ledgers = BTreeMap::new();
    for row in rows {
        let Some(id) = row
            .get("LedgerID")
            .and_then(parse_i64)
            .and_then(|id| i32::try_from(id).ok())
        else {
            continue;
        };
        let name = row
            .get("LedgerName")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        ledgers.entry(id).or_insert(name);
    }

    let ids = ledgers.keys().copied().collect();
    let names = ledgers.into_values().collect();
    (ids, names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use cdc_ledger::MemoryBindingStore;
    use serde_json::json;

    fn ledger_row(id: i64, name: &str) -> Payload {
        let mut row = Payload::new();
        row.insert("LedgerID".to_string(), json!(id));
        row.insert("LedgerName".to_string(), json!(name));
        row
    }

    fn binding(tenant: &str, a: &[i32]) -> LedgerBinding {
        LedgerBinding {
            tenant_id: tenant.to_string(),
            scope: LedgerScope {
                source_a: a.iter().copied().collect(),
                source_b: BTreeSet::new(),
            },
            ..LedgerBinding::default()
        }
    }

    fn resolver(store: MemoryBindingStore) -> BindingResolver {
        BindingResolver::new(
            Arc::new(store),
            BindingCache::new(16, Duration::from_secs(60)),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn resolve_reports_not_bound_and_unavailable() {
        let store = MemoryBindingStore::with_bindings([binding("bound@example.com", &[4])]);
        let resolver = resolver(store.clone());

        let scope = resolver
            .resolve("bound@example.com")
            .await
            .expect("bound tenant should resolve");
        assert_eq!(scope.source_a, BTreeSet::from([4]));

        assert!(matches!(
            resolver.resolve("stranger@example.com").await,
            Err(ResolveError::NotBound)
        ));

        store.set_unavailable(true);
        assert!(matches!(
            resolver.resolve("stranger@example.com").await,
            Err(ResolveError::Unavailable(_))
        ));
        // Cached scopes keep serving while the store is down.
        assert!(resolver.resolve("bound@example.com").await.is_ok());
    }

    #[tokio::test]
    async fn refresh_upserts_unique_ledgers_and_invalidates_cache() {
        let store = MemoryBindingStore::with_bindings([binding("buyer@example.com", &[1])]);
        let resolver = resolver(store.clone());
        resolver
            .resolve("buyer@example.com")
            .await
            .expect("initial resolve");

        let a = MemorySource::new(SourceTag::A).with_rows(
            "portal_validate_email_key",
            vec![ledger_row(12, "North"), ledger_row(10, "South"), ledger_row(12, "North")],
        );
        let b = MemorySource::new(SourceTag::B);
        b.set_failing(true);
        let executor = Executor::new(Arc::new(a.clone()), Arc::new(b), Duration::from_secs(1), 5);

        let (refreshed, failures) = resolver
            .refresh(&executor, "buyer@example.com", Some("KEY-1"))
            .await
            .expect("refresh should succeed with one source");
        assert_eq!(refreshed.scope.source_a, BTreeSet::from([10, 12]));
        assert_eq!(refreshed.source_a_names, vec!["South".to_string(), "North".to_string()]);
        assert!(refreshed.scope.source_b.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].source, SourceTag::B);

        let scope = resolver
            .resolve("buyer@example.com")
            .await
            .expect("resolve after refresh");
        assert_eq!(scope.source_a, BTreeSet::from([10, 12]));

        let (_, params) = &a.calls()[0];
        assert!(params.get("customer_key").is_some());
    }

    #[tokio::test]
    async fn refresh_fails_when_both_sources_fail() {
        let store = MemoryBindingStore::new();
        let resolver = resolver(store.clone());
        let a = MemorySource::new(SourceTag::A);
        let b = MemorySource::new(SourceTag::B);
        a.set_failing(true);
        b.set_failing(true);
        let executor = Executor::new(Arc::new(a), Arc::new(b), Duration::from_secs(1), 5);

        let err = resolver
            .refresh(&executor, "buyer@example.com", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::SourcesUnavailable(ref f) if f.len() == 2));
        assert!(matches!(
            resolver.resolve("buyer@example.com").await,
            Err(ResolveError::NotBound)
        ));
    }

    #[test]
    fn extract_ledgers_skips_rows_without_ids() {
        let mut bad = Payload::new();
        bad.insert("LedgerName".to_string(), json!("Nameless"));
        let (ids, names) = extract_ledgers(&[bad, ledger_row(3, " East ")]);
        assert_eq!(ids, BTreeSet::from([3]));
        assert_eq!(names, vec!["East".to_string()]);
    }
}
