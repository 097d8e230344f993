/// PostgreSQL tests
///
/// The same scoping guarantees against a real server. Each test is skipped
/// unless TEST_DATABASE_URL or DATABASE_URL points at a reachable database.
/// Run with: TEST_DATABASE_URL=postgres://... cargo test --test postgres_tests
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::sync::Arc;
use tenantdb::{
    Context, DbError, DomainError, ErrorCode, PgConnectionPool, Result, ScopeConfig, TenantId,
    TenantPolicy, TenantTransactionManager, TxHandle, exec, query,
};
use uuid::Uuid;

const READ: &str = "SELECT current_setting('app.current_organization', true)";
const APP_ROLE: &str = "tenantdb_test_app";

async fn maybe_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()?;

    PgPoolOptions::new()
        .max_connections(4)
        .connect(&database_url)
        .await
        .ok()
}

fn manager(pool: &PgPool) -> TenantTransactionManager {
    TenantTransactionManager::new(
        Arc::new(PgConnectionPool::new(pool.clone())),
        ScopeConfig::default(),
    )
    .expect("default scope is valid")
}

fn cx(tenant: TenantId) -> Context {
    Context::background().with_tenant(tenant)
}

/// Fresh table `tenantdb_test.products_<suffix>` with the tenant policy
/// applied and DML granted to a non-superuser role.
async fn create_products_table(pool: &PgPool) -> Option<String> {
    let table = format!("products_{}", Uuid::new_v4().simple());

    let setup = [
        "CREATE SCHEMA IF NOT EXISTS tenantdb_test".to_string(),
        format!(
            "CREATE TABLE tenantdb_test.{table} (
                id TEXT PRIMARY KEY,
                organization_id UUID NOT NULL,
                name TEXT NOT NULL
            )"
        ),
    ];
    for sql in setup {
        sqlx::query(&sql).execute(pool).await.ok()?;
    }

    let policy = TenantPolicy::new(&format!("tenantdb_test.{table}"), "organization_id");
    for sql in policy.statements(&ScopeConfig::default()) {
        sqlx::query(&sql).execute(pool).await.ok()?;
    }

    // Superusers bypass row-level security, so policy checks run as a
    // plain role. Role creation is allowed to race with other tests.
    let _ = sqlx::query(&format!("CREATE ROLE {APP_ROLE} NOLOGIN"))
        .execute(pool)
        .await;
    let grants = [
        format!("GRANT USAGE ON SCHEMA tenantdb_test TO {APP_ROLE}"),
        format!("GRANT SELECT, INSERT, UPDATE, DELETE ON tenantdb_test.{table} TO {APP_ROLE}"),
    ];
    for sql in grants {
        sqlx::query(&sql).execute(pool).await.ok()?;
    }

    Some(table)
}

async fn drop_table(pool: &PgPool, table: &str) {
    let _ = sqlx::query(&format!("DROP TABLE IF EXISTS tenantdb_test.{table}"))
        .execute(pool)
        .await;
}

async fn as_app_role(tx: &TxHandle) -> Result<()> {
    tx.execute(&format!("SET LOCAL ROLE {APP_ROLE}")).await?;
    Ok(())
}

async fn insert(tx: &TxHandle, table: &str, id: &str, org: TenantId) -> Result<()> {
    let mut session = tx.session().await?;
    sqlx::query(&format!(
        "INSERT INTO tenantdb_test.{table} (id, organization_id, name) VALUES ($1, $2, $3)"
    ))
    .bind(id)
    .bind(org.as_uuid())
    .bind(format!("product {id}"))
    .execute(session.postgres()?)
    .await?;
    Ok(())
}

async fn count(tx: &TxHandle, table: &str) -> Result<i64> {
    let mut session = tx.session().await?;
    let n = sqlx::query_scalar::<_, i64>(&format!("SELECT count(*) FROM tenantdb_test.{table}"))
        .fetch_one(session.postgres()?)
        .await?;
    Ok(n)
}

#[tokio::test]
async fn postgres_scope_binds_tenant() {
    let Some(pool) = maybe_pool().await else {
        eprintln!(
            "Skipping postgres_scope_binds_tenant: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable."
        );
        return;
    };
    let manager = manager(&pool);
    let tenant = TenantId::new();

    let seen = manager
        .run_in_transaction(&cx(tenant), |_cx, tx| async move { tx.query_text(READ).await })
        .await
        .expect("scope should run");

    assert_eq!(seen, Some(tenant.to_string()));
}

#[tokio::test]
async fn postgres_nested_scope_restores_parent_binding() {
    let Some(pool) = maybe_pool().await else {
        eprintln!(
            "Skipping postgres_nested_scope_restores_parent_binding: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable."
        );
        return;
    };
    let manager = manager(&pool);
    let a = TenantId::new();
    let b = TenantId::new();

    let (inside, after_commit, after_failure) = manager
        .run_in_transaction(&cx(a), |cx, tx| {
            let manager = &manager;
            async move {
                let inside = manager
                    .run_in_transaction(&cx.with_tenant(b), |_cx, tx| async move {
                        tx.query_text(READ).await
                    })
                    .await?;
                let after_commit = tx.query_text(READ).await?;

                let failed: Result<()> = manager
                    .run_in_transaction(&cx.with_tenant(b), |_cx, _tx| async move {
                        Err(DomainError::validation("rejected").into())
                    })
                    .await;
                assert!(failed.is_err());
                let after_failure = tx.query_text(READ).await?;

                Ok((inside, after_commit, after_failure))
            }
        })
        .await
        .expect("scope should run");

    assert_eq!(inside, Some(b.to_string()));
    assert_eq!(after_commit, Some(a.to_string()));
    assert_eq!(after_failure, Some(a.to_string()));
}

#[tokio::test]
async fn postgres_savepoint_isolation() {
    let Some(pool) = maybe_pool().await else {
        eprintln!(
            "Skipping postgres_savepoint_isolation: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable."
        );
        return;
    };
    let Some(table) = create_products_table(&pool).await else {
        eprintln!("Skipping postgres_savepoint_isolation: insufficient privileges for setup.");
        return;
    };
    let manager = manager(&pool);
    let a = TenantId::new();

    let result = manager
        .run_in_transaction(&cx(a), |cx, tx| {
            let manager = &manager;
            let table = table.as_str();
            async move {
                insert(&tx, table, "before", a).await?;

                let nested: Result<()> = manager
                    .run_in_transaction(&cx, |_cx, tx| async move {
                        insert(&tx, table, "nested", a).await?;
                        Err(DomainError::invariant("abort nested").into())
                    })
                    .await;
                assert!(nested.is_err());

                insert(&tx, table, "after", a).await?;
                count(&tx, table).await
            }
        })
        .await;

    let stored: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM tenantdb_test.{table}"))
        .fetch_one(&pool)
        .await
        .expect("count should succeed");
    drop_table(&pool, &table).await;

    assert_eq!(result.expect("scope should run"), 2);
    assert_eq!(stored, 2);
}

#[tokio::test]
async fn postgres_policy_isolates_tenants() {
    let Some(pool) = maybe_pool().await else {
        eprintln!(
            "Skipping postgres_policy_isolates_tenants: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable."
        );
        return;
    };
    let Some(table) = create_products_table(&pool).await else {
        eprintln!("Skipping postgres_policy_isolates_tenants: insufficient privileges for setup.");
        return;
    };
    let manager = manager(&pool);
    let t1 = TenantId::new();
    let t2 = TenantId::new();
    let table_ref = table.as_str();

    exec(&manager, &cx(t1), |_cx, tx| async move {
        as_app_role(&tx).await?;
        insert(&tx, table_ref, "fudge", t1).await
    })
    .await
    .expect("insert should succeed");

    let seen_by_t2 = query(&manager, &cx(t2), |_cx, tx| async move {
        as_app_role(&tx).await?;
        count(&tx, table_ref).await
    })
    .await
    .expect("count should succeed");

    let smuggled = exec(&manager, &cx(t2), |_cx, tx| async move {
        as_app_role(&tx).await?;
        insert(&tx, table_ref, "smuggled", t1).await
    })
    .await;

    drop_table(&pool, &table).await;

    assert_eq!(seen_by_t2, 0);
    assert!(matches!(
        smuggled,
        Err(DbError::Engine(ref e)) if e.sql_state() == Some("42501")
    ));
}

#[tokio::test]
async fn postgres_duplicate_key_is_conflict() {
    let Some(pool) = maybe_pool().await else {
        eprintln!(
            "Skipping postgres_duplicate_key_is_conflict: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable."
        );
        return;
    };
    let Some(table) = create_products_table(&pool).await else {
        eprintln!("Skipping postgres_duplicate_key_is_conflict: insufficient privileges for setup.");
        return;
    };
    let manager = manager(&pool);
    let tenant = TenantId::new();
    let table_ref = table.as_str();

    let first = exec(&manager, &cx(tenant), |_cx, tx| async move {
        insert(&tx, table_ref, "p1", tenant).await
    })
    .await;
    let second = exec(&manager, &cx(tenant), |_cx, tx| async move {
        insert(&tx, table_ref, "p1", tenant).await
    })
    .await;
    let missing = query(&manager, &cx(tenant), |_cx, tx| async move {
        let mut session = tx.session().await?;
        let name: String = sqlx::query_scalar(&format!(
            "SELECT name FROM tenantdb_test.{table_ref} WHERE id = 'nope'"
        ))
        .fetch_one(session.postgres()?)
        .await?;
        Ok(name)
    })
    .await;

    drop_table(&pool, &table).await;

    assert!(first.is_ok());
    assert!(second.unwrap_err().is(ErrorCode::Conflict));
    assert!(missing.unwrap_err().is(ErrorCode::NotFound));
}
