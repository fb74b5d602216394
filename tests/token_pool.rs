use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use zai_gateway::token::{SqliteTokenPool, TokenOrigin, TokenPool, TokenResolver};

async fn seed_accounts(path: &Path, rows: &[(&str, Option<&str>, &str)]) {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("create db");
    sqlx::query(
        r#"CREATE TABLE accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL,
            password TEXT NOT NULL DEFAULT '',
            token TEXT,
            apikey TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )"#,
    )
    .execute(&pool)
    .await
    .expect("create table");
    for (email, token, status) in rows {
        sqlx::query("INSERT INTO accounts (email, token, status) VALUES (?, ?, ?)")
            .bind(*email)
            .bind(*token)
            .bind(*status)
            .execute(&pool)
            .await
            .expect("insert account");
    }
    pool.close().await;
}

#[tokio::test]
async fn pool_returns_only_active_non_empty_tokens() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("accounts.db");
    seed_accounts(
        &path,
        &[
            ("a@example.com", Some("active-token"), "active"),
            ("b@example.com", Some("disabled-token"), "disabled"),
            ("c@example.com", Some(""), "active"),
            ("d@example.com", None, "active"),
        ],
    )
    .await;

    let pool = SqliteTokenPool::open(&path.display().to_string());
    for _ in 0..10 {
        let token = pool.random_token().await.expect("query");
        assert_eq!(token.as_deref(), Some("active-token"));
    }
}

#[tokio::test]
async fn empty_table_yields_no_token() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("accounts.db");
    seed_accounts(&path, &[("x@example.com", Some("t"), "banned")]).await;

    let pool = SqliteTokenPool::open(&path.display().to_string());
    assert_eq!(pool.random_token().await.expect("query"), None);
}

#[tokio::test]
async fn missing_database_is_an_error_not_a_panic() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("absent.db");
    let pool = SqliteTokenPool::open(&path.display().to_string());
    assert!(pool.random_token().await.is_err());
    assert!(!path.exists());
}

#[tokio::test]
async fn resolver_draws_from_pool_when_no_static_token() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("accounts.db");
    seed_accounts(&path, &[("a@example.com", Some("pooled"), "active")]).await;

    let resolver = TokenResolver::new(None)
        .with_pool(Arc::new(SqliteTokenPool::open(&path.display().to_string())));
    let token = resolver.resolve(None).await.expect("resolve");
    assert_eq!(token.value, "pooled");
    assert_eq!(token.origin, TokenOrigin::PoolRandom);

    let token = resolver.resolve(Some("header-token")).await.expect("resolve");
    assert_eq!(token.origin, TokenOrigin::ExplicitHeader);
}

#[tokio::test]
async fn resolver_reports_unavailable_when_pool_is_broken() {
    let dir = TempDir::new().expect("temp dir");
    let resolver = TokenResolver::new(None).with_pool(Arc::new(SqliteTokenPool::open(
        &dir.path().join("absent.db").display().to_string(),
    )));
    let err = resolver.resolve(None).await.unwrap_err();
    assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
}
