use std::collections::BTreeSet;
use std::time::Duration;

use cdc_contracts::LedgerScope;
use cdc_ledger::{BindingLookup, BindingStore, LedgerBinding};

fn test_db_url() -> Option<String> {
    std::env::var("CDC_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn migrations_apply_and_are_idempotent() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB migration test; set CDC_TEST_DB_URL to enable");
        return;
    };

    let schema = format!("cdc_test_{}", ulid::Ulid::new());

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .expect("DB connect should succeed");

    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&pool)
        .await
        .expect("create schema should succeed");
    sqlx::query(&format!("SET search_path TO {}", schema))
        .execute(&pool)
        .await
        .expect("set search_path should succeed");

    cdc_ledger::migrate(&pool)
        .await
        .expect("migrations should apply");
    cdc_ledger::migrate(&pool)
        .await
        .expect("migrations should be idempotent");

    let blank = sqlx::query("INSERT INTO cdc_tenant_bindings (tenant_id) VALUES ($1)")
        .bind("   ")
        .execute(&pool)
        .await
        .expect_err("blank tenant ids must be rejected");
    assert!(
        format!("{blank:?}").contains("cdc_tenant_bindings_tenant_nonempty"),
        "expected check constraint error, got: {blank:?}"
    );

    let _ = sqlx::query(&format!("DROP SCHEMA {} CASCADE", schema))
        .execute(&pool)
        .await;
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binding_store_round_trips_and_overwrites_bindings() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping binding store test; set CDC_TEST_DB_URL to enable");
        return;
    };

    let schema = format!("cdc_test_{}", ulid::Ulid::new());
    let schema_url = schema_db_url(&db_url, &schema);

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .expect("DB connect should succeed");
    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&pool)
        .await
        .expect("create schema should succeed");

    let store = BindingStore::connect_and_migrate(&schema_url, Duration::from_millis(500))
        .await
        .expect("binding store init should succeed");

    store.ping().await.expect("ping should succeed");
    assert!(
        store
            .find_binding("nobody@example.com")
            .await
            .expect("lookup should succeed")
            .is_none()
    );

    let mut binding = LedgerBinding {
        tenant_id: "buyer@example.com".to_string(),
        scope: LedgerScope {
            source_a: BTreeSet::from([12, 4]),
            source_b: BTreeSet::new(),
        },
        source_a_names: vec!["North Plant".to_string(), "Depot".to_string()],
        source_b_names: Vec::new(),
        refreshed_at: None,
    };
    store
        .upsert_binding(&binding)
        .await
        .expect("insert should succeed");

    let found = store
        .find_binding("buyer@example.com")
        .await
        .expect("lookup should succeed")
        .expect("binding should exist");
    assert_eq!(found.scope, binding.scope);
    assert_eq!(found.source_a_names, binding.source_a_names);
    let first_refresh = found.refreshed_at.expect("refreshed_at should be set");

    binding.scope.source_b = BTreeSet::from([77]);
    binding.source_b_names = vec!["Export".to_string()];
    store
        .upsert_binding(&binding)
        .await
        .expect("update should succeed");

    let found = store
        .find_binding("buyer@example.com")
        .await
        .expect("lookup should succeed")
        .expect("binding should exist");
    assert_eq!(found.scope.source_b, BTreeSet::from([77]));
    assert!(found.refreshed_at.expect("refreshed_at should be set") >= first_refresh);

    store.close().await;
    let _ = sqlx::query(&format!("DROP SCHEMA {} CASCADE", schema))
        .execute(&pool)
        .await;
    pool.close().await;
}
