use std::env;

use ackify_server::chain;
use ackify_server::config::{MagicLinkConfig, RateLimitConfig};
use ackify_server::magic_link::{self, TokenError};
use ackify_server::sessions::User;
use ackify_server::signatures::{self, SignatureError};
use ackify_server::signing::CanonicalSigner;
use ackify_server::tenant::TenantTx;
use sqlx::PgPool;
use uuid::Uuid;

// The DSN must use a non-superuser role (the migrations create `ackify_app`)
// so row-level security scopes each test run to its own random tenant.
async fn test_pool() -> Option<PgPool> {
    let dsn = env::var("ACKIFY_TEST_DB_DSN").ok()?;
    Some(PgPool::connect(&dsn).await.expect("connect test database"))
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a migrated Postgres (set ACKIFY_TEST_DB_DSN)"]
async fn ledger_chains_and_rejects_duplicates() {
    let Some(pool) = test_pool().await else { return };
    // A fresh tenant id isolates this run's signature stream.
    let tenant_id = Uuid::new_v4();
    let signer = CanonicalSigner::from_env_value(None).expect("signer");
    let doc = format!("doc-{}", Uuid::new_v4());

    let alice = User::new("u1", "A@X.example", Some("Alice".into()));
    let mut tx = TenantTx::begin(&pool, tenant_id).await.expect("begin");
    let first = signatures::create_proof(&mut tx, &signer, &alice, &doc, None)
        .await
        .expect("first signature");
    tx.commit().await.expect("commit");

    assert_eq!(first.user_email, "a@x.example");
    assert!(first.prev_hash.is_none());
    assert!(!first.signature.is_empty());

    // Same (doc, user) again: the uniqueness constraint must hold.
    let mut tx = TenantTx::begin(&pool, tenant_id).await.expect("begin");
    let dup = signatures::create_proof(&mut tx, &signer, &alice, &doc, None).await;
    tx.rollback().await.expect("rollback");
    assert!(matches!(dup, Err(SignatureError::AlreadyExists)));

    let bob = User::new("u2", "b@x.example", None);
    let doc2 = format!("doc-{}", Uuid::new_v4());
    let mut tx = TenantTx::begin(&pool, tenant_id).await.expect("begin");
    let second = signatures::create_proof(&mut tx, &signer, &bob, &doc2, None)
        .await
        .expect("second signature");
    tx.commit().await.expect("commit");

    assert_eq!(second.prev_hash.as_deref(), Some(chain::record_hash(&first).as_str()));

    let mut tx = TenantTx::begin(&pool, tenant_id).await.expect("begin");
    let report = signatures::verify_chain(&mut tx).await.expect("verify");
    tx.commit().await.expect("commit");
    assert!(report.valid, "fresh ledger must verify: {:?}", report.detail);
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a migrated Postgres (set ACKIFY_TEST_DB_DSN)"]
async fn broken_chain_is_detected_and_rebuilt() {
    let Some(pool) = test_pool().await else { return };
    let tenant_id = Uuid::new_v4();
    let signer = CanonicalSigner::from_env_value(None).expect("signer");

    let mut ids = Vec::new();
    for n in 0..3 {
        let user = User::new(format!("u{n}"), format!("u{n}@x.example"), None);
        let doc = format!("doc-{}", Uuid::new_v4());
        let mut tx = TenantTx::begin(&pool, tenant_id).await.expect("begin");
        let sig = signatures::create_proof(&mut tx, &signer, &user, &doc, None)
            .await
            .expect("signature");
        tx.commit().await.expect("commit");
        ids.push(sig.id);
    }

    let mut tx = TenantTx::begin(&pool, tenant_id).await.expect("begin");
    signatures::update_prev_hash(tx.conn(), ids[2], Some("corrupted"))
        .await
        .expect("corrupt link");
    let report = signatures::verify_chain(&mut tx).await.expect("verify");
    assert!(!report.valid);
    assert_eq!(report.broken_at, Some(ids[2]));

    let updated = signatures::rebuild_chain(&mut tx).await.expect("rebuild");
    assert!(updated >= 1);
    let repaired = signatures::verify_chain(&mut tx).await.expect("verify");
    assert!(repaired.valid);
    // A second rebuild finds nothing to do.
    let second = signatures::rebuild_chain(&mut tx).await.expect("rebuild");
    assert_eq!(second, 0);
    tx.commit().await.expect("commit");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a migrated Postgres (set ACKIFY_TEST_DB_DSN)"]
async fn magic_link_tokens_are_single_use_and_rate_limited() {
    let Some(pool) = test_pool().await else { return };
    let tenant_id = Uuid::new_v4();
    let limits = RateLimitConfig {
        global_per_minute: 100,
        auth_per_minute: 5,
        doc_create_per_minute: 10,
        magic_link_per_email: 3,
        magic_link_per_ip: 10,
        magic_link_window_secs: 3600,
        proxy_ip_per_minute: 60,
        proxy_ip_doc_per_minute: 20,
        proxy_doc_per_minute: 300,
    };
    let ttl = MagicLinkConfig {
        login_ttl_minutes: 15,
        reminder_ttl_hours: 24,
        janitor_interval_secs: 3600,
    };
    let email = format!("reader-{}@x.example", Uuid::new_v4());

    let mut tx = TenantTx::begin(&pool, tenant_id).await.expect("begin");
    let token = magic_link::request_login_token(
        tx.conn(), &limits, &ttl, &email, None, "198.51.100.7", "test-agent",
    )
    .await
    .expect("token issued");
    tx.commit().await.expect("commit");

    let mut tx = TenantTx::begin(&pool, tenant_id).await.expect("begin");
    let verified = magic_link::verify_token(tx.conn(), &token, "198.51.100.7", "test-agent")
        .await
        .expect("first verify succeeds");
    assert_eq!(verified.email, email);
    tx.commit().await.expect("commit");

    let mut tx = TenantTx::begin(&pool, tenant_id).await.expect("begin");
    let replay = magic_link::verify_token(tx.conn(), &token, "198.51.100.7", "test-agent").await;
    tx.rollback().await.expect("rollback");
    assert!(matches!(replay, Err(TokenError::Used)));

    // Two more requests exhaust the per-email budget of three.
    for _ in 0..2 {
        let mut tx = TenantTx::begin(&pool, tenant_id).await.expect("begin");
        magic_link::request_login_token(
            tx.conn(), &limits, &ttl, &email, None, "198.51.100.7", "test-agent",
        )
        .await
        .expect("within limit");
        tx.commit().await.expect("commit");
    }
    let mut tx = TenantTx::begin(&pool, tenant_id).await.expect("begin");
    let limited = magic_link::request_login_token(
        tx.conn(), &limits, &ttl, &email, None, "198.51.100.7", "test-agent",
    )
    .await;
    tx.rollback().await.expect("rollback");
    assert!(matches!(limited, Err(TokenError::RateLimited { .. })));
}
