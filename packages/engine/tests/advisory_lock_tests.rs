//! Advisory lock service behavior against a real database.

mod common;

use common::TestHarness;
use test_context::test_context;

use engine_core::advisory::{with_lock, LockMode, LockSession};
use engine_core::EngineError;

#[test_context(TestHarness)]
#[tokio::test]
async fn try_lock_excludes_other_sessions(ctx: &mut TestHarness) {
    let key = "install:local-dev:core.domain@v1";

    let mut holder = LockSession::open(&ctx.db_pool).await.unwrap();
    assert!(holder.try_lock(key).await.unwrap());

    let mut contender = LockSession::open(&ctx.db_pool).await.unwrap();
    assert!(!contender.try_lock(key).await.unwrap());

    // A different key is unaffected.
    assert!(contender.try_lock("install:local-dev:other@v1").await.unwrap());
    assert!(contender.unlock("install:local-dev:other@v1").await.unwrap());

    assert!(holder.unlock(key).await.unwrap());
    assert!(contender.try_lock(key).await.unwrap());
    assert!(contender.unlock(key).await.unwrap());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn unlock_without_hold_returns_false(ctx: &mut TestHarness) {
    let mut session = LockSession::open(&ctx.db_pool).await.unwrap();
    assert!(!session.unlock("never-held").await.unwrap());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn with_lock_fail_fast_raises_when_held(ctx: &mut TestHarness) {
    let key = "install:local-dev:contended@v1";

    let mut holder = LockSession::open(&ctx.db_pool).await.unwrap();
    assert!(holder.try_lock(key).await.unwrap());

    let result = with_lock(&ctx.db_pool, key, LockMode::FailFast, || async {
        Ok(())
    })
    .await;

    match result {
        Err(e) => match e.downcast_ref::<EngineError>() {
            Some(EngineError::LockUnavailable { key: k }) => assert_eq!(k, key),
            other => panic!("expected LockUnavailable, got {:?}", other),
        },
        Ok(()) => panic!("expected LockUnavailable"),
    }

    assert!(holder.unlock(key).await.unwrap());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn with_lock_releases_on_success_and_error(ctx: &mut TestHarness) {
    let key = "install:local-dev:scoped@v1";

    let out = with_lock(&ctx.db_pool, key, LockMode::FailFast, || async {
        Ok(42)
    })
    .await
    .unwrap();
    assert_eq!(out, 42);

    // Released: immediately acquirable again, even after a failing body.
    let failed: anyhow::Result<()> =
        with_lock(&ctx.db_pool, key, LockMode::FailFast, || async {
            anyhow::bail!("body failed")
        })
        .await;
    assert!(failed.is_err());

    let mut session = LockSession::open(&ctx.db_pool).await.unwrap();
    assert!(session.try_lock(key).await.unwrap());
    assert!(session.unlock(key).await.unwrap());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn blocking_mode_waits_for_release(ctx: &mut TestHarness) {
    let key = "install:local-dev:blocking@v1";

    let mut holder = LockSession::open(&ctx.db_pool).await.unwrap();
    assert!(holder.try_lock(key).await.unwrap());

    let pool = ctx.db_pool.clone();
    let key_owned = key.to_string();
    let waiter = tokio::spawn(async move {
        with_lock(&pool, &key_owned, LockMode::Blocking, || async { Ok(()) }).await
    });

    // Give the waiter time to block on the held lock, then release.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(holder.unlock(key).await.unwrap());

    waiter.await.unwrap().unwrap();
}
