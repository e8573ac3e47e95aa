use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use cdc_contracts::{Payload, SourceTag};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;

mod memory;

pub use memory::MemorySource;

/// One result set of a procedure call, in upstream order.
pub type ResultSet = Vec<Payload>;

pub const PROCEDURE_ALLOWLIST: &[&str] = &[
    "portal_orders_list",
    "portal_dispatches_list",
    "portal_approvals_list",
    "portal_otif_list",
    "portal_dashboard",
    "portal_order_processes",
    "portal_order_deliveries",
    "portal_validate_email_key",
];

pub fn is_allowlisted_procedure(procedure: &str) -> bool {
    PROCEDURE_ALLOWLIST.contains(&procedure)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Text(String),
    IntArray(Vec<i32>),
    Timestamp(DateTime<Utc>),
}

impl ParamValue {
    fn sql_type(&self) -> &'static str {
        match self {
            ParamValue::Int(_) => "bigint",
            ParamValue::Text(_) => "text",
            ParamValue::IntArray(_) => "integer[]",
            ParamValue::Timestamp(_) => "timestamptz",
        }
    }
}

/// Named procedure arguments. Absent optional arguments are omitted so the
/// upstream default applies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcedureParams {
    params: Vec<(&'static str, ParamValue)>,
}

impl ProcedureParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger_ids(self, ids: &BTreeSet<i32>) -> Self {
        self.with("ledger_ids", ParamValue::IntArray(ids.iter().copied().collect()))
    }

    pub fn int(self, name: &'static str, value: i64) -> Self {
        self.with(name, ParamValue::Int(value))
    }

    pub fn text(self, name: &'static str, value: impl Into<String>) -> Self {
        self.with(name, ParamValue::Text(value.into()))
    }

    pub fn timestamp(self, name: &'static str, value: DateTime<Utc>) -> Self {
        self.with(name, ParamValue::Timestamp(value))
    }

    pub fn opt_int(self, name: &'static str, value: Option<i64>) -> Self {
        match value {
            Some(v) => self.int(name, v),
            None => self,
        }
    }

    pub fn opt_text(self, name: &'static str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.text(name, v),
            None => self,
        }
    }

    pub fn opt_timestamp(self, name: &'static str, value: Option<DateTime<Utc>>) -> Self {
        match value {
            Some(v) => self.timestamp(name, v),
            None => self,
        }
    }

    fn with(mut self, name: &'static str, value: ParamValue) -> Self {
        self.params.retain(|(n, _)| *n != name);
        self.params.push((name, value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ParamValue)> {
        self.params.iter().map(|(n, v)| (*n, v))
    }
}

#[derive(Debug)]
pub enum SourceError {
    Timeout,
    NotAllowlisted(String),
    Protocol(String),
    Sqlx(sqlx::Error),
}

impl SourceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SourceError::Timeout)
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Timeout => write!(f, "source query timed out"),
            SourceError::NotAllowlisted(name) => write!(f, "procedure not allowlisted: {}", name),
            SourceError::Protocol(reason) => write!(f, "unexpected source response: {}", reason),
            SourceError::Sqlx(err) => write!(f, "source sql error: {}", err),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<sqlx::Error> for SourceError {
    fn from(value: sqlx::Error) -> Self {
        SourceError::Sqlx(value)
    }
}

/// An upstream customer database reachable through named procedures.
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn tag(&self) -> SourceTag;

    async fn execute(
        &self,
        procedure: &str,
        params: &ProcedureParams,
    ) -> Result<Vec<ResultSet>, SourceError>;

    async fn ping(&self) -> Result<(), SourceError>;

    async fn close(&self) {}
}

/// Postgres-backed source. Procedures are set-returning functions yielding
/// `(result_set integer, row jsonb)`.
pub struct PgSourceClient {
    tag: SourceTag,
    pool: sqlx::PgPool,
    query_timeout: Duration,
}

impl PgSourceClient {
    /// Connections are opened lazily, so a source that is down at startup
    /// degrades requests instead of blocking boot.
    pub fn open(
        tag: SourceTag,
        db_url: &str,
        max_connections: u32,
        query_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(query_timeout)
            .connect_lazy(db_url)?;

        Ok(Self {
            tag,
            pool,
            query_timeout,
        })
    }
}

#[async_trait]
impl SourceClient for PgSourceClient {
    fn tag(&self) -> SourceTag {
        self.tag
    }

    async fn execute(
        &self,
        procedure: &str,
        params: &ProcedureParams,
    ) -> Result<Vec<ResultSet>, SourceError> {
        let sql = procedure_sql(procedure, params)?;
        let timeout_str = format!("{}ms", self.query_timeout.as_millis());

        let rows = tokio::time::timeout(self.query_timeout, async {
            let mut tx = self.pool.begin().await?;

            sqlx::query("SELECT set_config('statement_timeout', $1, true)")
                .bind(&timeout_str)
                .execute(&mut *tx)
                .await?;

            let mut query = sqlx::query(&sql);
            for (_, value) in params.iter() {
                query = match value {
                    ParamValue::Int(v) => query.bind(*v),
                    ParamValue::Text(v) => query.bind(v.as_str()),
                    ParamValue::IntArray(v) => query.bind(v.as_slice()),
                    ParamValue::Timestamp(v) => query.bind(*v),
                };
            }
            let rows = query.fetch_all(&mut *tx).await?;

            tx.commit().await?;
            Ok::<_, sqlx::Error>(rows)
        })
        .await
        .map_err(|_| SourceError::Timeout)??;

        let mut sets: Vec<ResultSet> = Vec::new();
        for row in rows {
            let index: i32 = row.try_get("result_set")?;
            let value: serde_json::Value = row.try_get("row")?;
            let index = usize::try_from(index)
                .map_err(|_| SourceError::Protocol(format!("negative result_set {}", index)))?;
            let serde_json::Value::Object(payload) = value else {
                return Err(SourceError::Protocol("row is not a JSON object".to_string()));
            };
            if sets.len() <= index {
                sets.resize_with(index + 1, Vec::new);
            }
            sets[index].push(payload);
        }

        Ok(sets)
    }

    async fn ping(&self) -> Result<(), SourceError> {
        tokio::time::timeout(self.query_timeout, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map_err(|_| SourceError::Timeout)??;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Builds the call for an allowlisted procedure with named-argument notation
/// and typed placeholders in parameter order.
fn procedure_sql(procedure: &str, params: &ProcedureParams) -> Result<String, SourceError> {
    if !is_allowlisted_procedure(procedure) {
        return Err(SourceError::NotAllowlisted(procedure.to_string()));
    }

    let mut args = Vec::new();
    for (idx, (name, value)) in params.iter().enumerate() {
        if !is_safe_identifier(name) {
            return Err(SourceError::Protocol(format!("invalid argument name {}", name)));
        }
        args.push(format!("{} => ${}::{}", name, idx + 1, value.sql_type()));
    }

    Ok(format!(
        "SELECT r.result_set, r.\"row\" FROM {}({}) WITH ORDINALITY AS r(result_set, \"row\", ord) ORDER BY r.result_set, r.ord",
        procedure,
        args.join(", ")
    ))
}

fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        && !name.as_bytes()[0].is_ascii_digit()
}
