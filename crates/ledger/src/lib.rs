use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cdc_contracts::LedgerScope;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const MIGRATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum LedgerError {
    Timeout,
    Unavailable,
    InvalidBinding(&'static str),
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Timeout => write!(f, "binding store operation timed out"),
            LedgerError::Unavailable => write!(f, "binding store unavailable"),
            LedgerError::InvalidBinding(reason) => write!(f, "invalid binding: {}", reason),
            LedgerError::Sqlx(err) => write!(f, "binding store sql error: {}", err),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<sqlx::Error> for LedgerError {
    fn from(value: sqlx::Error) -> Self {
        LedgerError::Sqlx(value)
    }
}

/// A tenant's ledger ids on each upstream, as last refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LedgerBinding {
    pub tenant_id: String,
    pub scope: LedgerScope,
    pub source_a_names: Vec<String>,
    pub source_b_names: Vec<String>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl LedgerBinding {
    fn validate(&self) -> Result<(), LedgerError> {
        if self.tenant_id.trim().is_empty() {
            return Err(LedgerError::InvalidBinding("tenant_id must be non-empty"));
        }
        Ok(())
    }
}

#[async_trait]
pub trait BindingLookup: Send + Sync {
    /// `Ok(None)` means the tenant has no binding record.
    async fn find_binding(&self, tenant_id: &str) -> Result<Option<LedgerBinding>, LedgerError>;

    async fn upsert_binding(&self, binding: &LedgerBinding) -> Result<(), LedgerError>;

    async fn ping(&self) -> Result<(), LedgerError>;

    async fn close(&self) {}
}

#[derive(Clone)]
pub struct BindingStore {
    pool: sqlx::PgPool,
    op_timeout: Duration,
}

impl BindingStore {
    pub async fn connect(db_url: &str, op_timeout: Duration) -> Result<Self, LedgerError> {
        let pool = tokio::time::timeout(
            CONNECT_TIMEOUT,
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(Self { pool, op_timeout })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        op_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let store = Self::connect(db_url, op_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(MIGRATE_TIMEOUT, migrate(&self.pool))
            .await
            .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }
}

#[async_trait]
impl BindingLookup for BindingStore {
    async fn find_binding(&self, tenant_id: &str) -> Result<Option<LedgerBinding>, LedgerError> {
        let row = tokio::time::timeout(
            self.op_timeout,
            sqlx::query(
                "SELECT tenant_id, source_a_ledger_ids, source_b_ledger_ids, source_a_ledger_names, source_b_ledger_names, refreshed_at FROM cdc_tenant_bindings WHERE tenant_id = $1",
            )
            .bind(tenant_id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        let Some(row) = row else {
            return Ok(None);
        };

        let source_a: Vec<i32> = row.try_get("source_a_ledger_ids")?;
        let source_b: Vec<i32> = row.try_get("source_b_ledger_ids")?;
        Ok(Some(LedgerBinding {
            tenant_id: row.try_get("tenant_id")?,
            scope: LedgerScope {
                source_a: source_a.into_iter().collect(),
                source_b: source_b.into_iter().collect(),
            },
            source_a_names: row.try_get("source_a_ledger_names")?,
            source_b_names: row.try_get("source_b_ledger_names")?,
            refreshed_at: row.try_get("refreshed_at")?,
        }))
    }

    async fn upsert_binding(&self, binding: &LedgerBinding) -> Result<(), LedgerError> {
        binding.validate()?;
        let source_a = ids(&binding.scope.source_a);
        let source_b = ids(&binding.scope.source_b);

        tokio::time::timeout(
            self.op_timeout,
            sqlx::query(
                "INSERT INTO cdc_tenant_bindings (tenant_id, source_a_ledger_ids, source_b_ledger_ids, source_a_ledger_names, source_b_ledger_names, refreshed_at) VALUES ($1, $2, $3, $4, $5, now()) \
                 ON CONFLICT (tenant_id) DO UPDATE SET source_a_ledger_ids = EXCLUDED.source_a_ledger_ids, source_b_ledger_ids = EXCLUDED.source_b_ledger_ids, source_a_ledger_names = EXCLUDED.source_a_ledger_names, source_b_ledger_names = EXCLUDED.source_b_ledger_names, refreshed_at = now()",
            )
            .bind(&binding.tenant_id)
            .bind(&source_a)
            .bind(&source_b)
            .bind(&binding.source_a_names)
            .bind(&binding.source_b_names)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(
            self.op_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn ids(set: &BTreeSet<i32>) -> Vec<i32> {
    set.iter().copied().collect()
}

/// Binding store held in process memory. Used by tests and local runs
/// without a database.
#[derive(Clone, Default)]
pub struct MemoryBindingStore {
    bindings: Arc<RwLock<HashMap<String, LedgerBinding>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryBindingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bindings(bindings: impl IntoIterator<Item = LedgerBinding>) -> Self {
        let store = Self::default();
        if let Ok(mut guard) = store.bindings.write() {
            for binding in bindings {
                guard.insert(binding.tenant_id.clone(), binding);
            }
        }
        store
    }

    /// Makes every call fail with `LedgerError::Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(LedgerError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl BindingLookup for MemoryBindingStore {
    async fn find_binding(&self, tenant_id: &str) -> Result<Option<LedgerBinding>, LedgerError> {
        self.check()?;
        let guard = self.bindings.read().map_err(|_| LedgerError::Unavailable)?;
        Ok(guard.get(tenant_id).cloned())
    }

    async fn upsert_binding(&self, binding: &LedgerBinding) -> Result<(), LedgerError> {
        self.check()?;
        binding.validate()?;
        let mut stored = binding.clone();
        stored.refreshed_at = Some(Utc::now());
        let mut guard = self.bindings.write().map_err(|_| LedgerError::Unavailable)?;
        guard.insert(stored.tenant_id.clone(), stored);
        Ok(())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        self.check()
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn migrate_url(db_url: &str) -> Result<(), sqlx::Error> {
    let pool = sqlx::PgPool::connect(db_url).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}
