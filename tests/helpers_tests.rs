/// Typed helper tests
///
/// `query` / `exec` end to end: results pass through, engine signals with a
/// domain meaning are translated, everything else is left alone.
/// Run with: cargo test --test helpers_tests
use serde_json::json;
use std::sync::Arc;
use tenantdb::{
    Context, DbError, DomainError, EngineError, ErrorCode, Fault, MemoryPool, MemoryRow,
    ScopeConfig, TenantId, TenantTransactionManager, exec, query,
};

const VAR: &str = "app.current_organization";

fn setup() -> (MemoryPool, TenantTransactionManager) {
    let pool = MemoryPool::new().with_policy("products", VAR);
    let manager =
        TenantTransactionManager::new(Arc::new(pool.clone()), ScopeConfig::default()).unwrap();
    (pool, manager)
}

fn cx(tenant: TenantId) -> Context {
    Context::background().with_tenant(tenant)
}

#[tokio::test]
async fn test_query_returns_value() {
    let (_pool, manager) = setup();
    let tenant = TenantId::new();

    exec(&manager, &cx(tenant), |_cx, tx| async move {
        let mut session = tx.session().await?;
        session
            .memory()?
            .insert("products", "p1", tenant, json!({ "name": "fudge", "price": 3 }))?;
        Ok(())
    })
    .await
    .unwrap();

    let row: MemoryRow = query(&manager, &cx(tenant), |_cx, tx| async move {
        let mut session = tx.session().await?;
        Ok(session.memory()?.get("products", "p1")?)
    })
    .await
    .unwrap();

    assert_eq!(row.tenant, tenant);
    assert_eq!(row.payload["name"], "fudge");
}

#[tokio::test]
async fn test_missing_row_is_not_found() {
    let (_pool, manager) = setup();

    let result = query(&manager, &cx(TenantId::new()), |_cx, tx| async move {
        let mut session = tx.session().await?;
        Ok(session.memory()?.get("products", "missing")?)
    })
    .await;

    match result.unwrap_err() {
        DbError::Domain(domain) => {
            assert_eq!(domain, ErrorCode::NotFound);
            assert_eq!(domain.to_string(), "NOT_FOUND: not found");
        }
        other => panic!("expected not found, got {other:?}"),
    }
}

#[tokio::test]
async fn test_other_tenants_row_is_not_found() {
    let (_pool, manager) = setup();
    let owner = TenantId::new();

    exec(&manager, &cx(owner), |_cx, tx| async move {
        let mut session = tx.session().await?;
        session.memory()?.insert("products", "p1", owner, json!(null))?;
        Ok(())
    })
    .await
    .unwrap();

    let err = query(&manager, &cx(TenantId::new()), |_cx, tx| async move {
        let mut session = tx.session().await?;
        Ok(session.memory()?.get("products", "p1")?)
    })
    .await
    .unwrap_err();

    assert_eq!(err.code(), Some(ErrorCode::NotFound));
}

#[tokio::test]
async fn test_duplicate_is_conflict() {
    let (_pool, manager) = setup();
    let tenant = TenantId::new();

    let insert = |key: &'static str| {
        let manager = &manager;
        async move {
            exec(manager, &cx(tenant), |_cx, tx| async move {
                let mut session = tx.session().await?;
                session.memory()?.insert("products", key, tenant, json!(null))?;
                Ok(())
            })
            .await
        }
    };

    insert("p1").await.unwrap();
    let err = insert("p1").await.unwrap_err();

    match &err {
        DbError::Domain(domain) => {
            assert_eq!(domain.code(), ErrorCode::Conflict);
            assert_eq!(domain.message(), "already exists");
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(err.to_string(), "CONFLICT: already exists");
}

#[tokio::test]
async fn test_other_engine_errors_pass_through() {
    let (pool, manager) = setup();
    pool.inject(Fault::Statement("SET LOCAL".into()));

    let err = exec(&manager, &cx(TenantId::new()), |_cx, _tx| async move { Ok(()) })
        .await
        .unwrap_err();

    match err {
        DbError::Engine(EngineError::Database { code, .. }) => assert_eq!(code, "XX000"),
        other => panic!("expected untranslated engine error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connection_errors_pass_through() {
    let (pool, manager) = setup();
    pool.inject(Fault::Begin);

    let err = query(&manager, &cx(TenantId::new()), |_cx, _tx| async move { Ok(1) })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Engine(EngineError::Connection(_))));
    assert_eq!(err.code(), None);
}

#[tokio::test]
async fn test_domain_errors_from_work_pass_through() {
    let (_pool, manager) = setup();

    let err = exec(&manager, &cx(TenantId::new()), |_cx, _tx| async move {
        Err::<(), _>(DomainError::forbidden("not your order").into())
    })
    .await
    .unwrap_err();

    assert!(err.is(ErrorCode::Forbidden));
    assert_eq!(err.to_string(), "FORBIDDEN: not your order");
}

#[tokio::test]
async fn test_missing_tenant_is_not_translated() {
    let (pool, manager) = setup();

    let err = query(&manager, &Context::background(), |_cx, _tx| async move { Ok(()) })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::TenantMissing));
    assert_eq!(pool.stats().acquisitions, 0);
}

#[tokio::test]
async fn test_nested_helpers() {
    let (pool, manager) = setup();
    let a = TenantId::new();
    let b = TenantId::new();

    let count = query(&manager, &cx(a), |cx, tx| {
        let manager = &manager;
        async move {
            {
                let mut session = tx.session().await?;
                session.memory()?.insert("products", "a1", a, json!(null))?;
            }

            // Conflict inside the nested scope is translated there and only
            // rolls back the savepoint.
            let nested = exec(manager, &cx.with_tenant(b), |_cx, tx| async move {
                let mut session = tx.session().await?;
                session.memory()?.insert("products", "a1", b, json!(null))?;
                Ok(())
            })
            .await;
            assert!(nested.unwrap_err().is(ErrorCode::Conflict));

            let mut session = tx.session().await?;
            Ok(session.memory()?.select("products")?.len())
        }
    })
    .await
    .unwrap();

    assert_eq!(count, 1);
    assert_eq!(pool.committed_rows("products").len(), 1);
}
