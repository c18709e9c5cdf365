//! Claim protocol, scheduling, and lease CAS behavior.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::TestHarness;
use serde_json::json;
use test_context::test_context;

use engine_core::model::RunStatus;
use engine_core::queue::renew_lease;
use engine_core::{cancel_run, claim_runs, enqueue_run, EnqueueOptions};

#[test_context(TestHarness)]
#[tokio::test]
async fn future_run_at_is_not_claimable(ctx: &mut TestHarness) {
    let future = enqueue_run(
        &ctx.db_pool,
        "core.test.echo@v1",
        json!({}),
        EnqueueOptions::builder()
            .run_at(Utc::now() + chrono::Duration::seconds(60))
            .build(),
    )
    .await
    .unwrap();

    let claimed = claim_runs(&ctx.db_pool, "worker-1", 10, 60).await.unwrap();
    assert!(claimed.is_empty());

    // At run_at <= now the same shape of row is eligible.
    let ready = enqueue_run(
        &ctx.db_pool,
        "core.test.echo@v1",
        json!({}),
        EnqueueOptions::builder()
            .run_at(Utc::now() - chrono::Duration::seconds(1))
            .build(),
    )
    .await
    .unwrap();

    let claimed = claim_runs(&ctx.db_pool, "worker-1", 10, 60).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, ready.id);
    assert_ne!(claimed[0].id, future.id);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn claim_orders_by_priority(ctx: &mut TestHarness) {
    let background = enqueue_run(
        &ctx.db_pool,
        "core.test.echo@v1",
        json!({}),
        EnqueueOptions::builder().priority(200).build(),
    )
    .await
    .unwrap();
    let critical = enqueue_run(
        &ctx.db_pool,
        "core.test.echo@v1",
        json!({}),
        EnqueueOptions::builder().priority(5).build(),
    )
    .await
    .unwrap();

    let first = claim_runs(&ctx.db_pool, "worker-1", 1, 60).await.unwrap();
    assert_eq!(first[0].id, critical.id);

    let second = claim_runs(&ctx.db_pool, "worker-1", 1, 60).await.unwrap();
    assert_eq!(second[0].id, background.id);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn claim_sets_lease_and_ownership(ctx: &mut TestHarness) {
    enqueue_run(
        &ctx.db_pool,
        "core.test.echo@v1",
        json!({}),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    let claimed = claim_runs(&ctx.db_pool, "worker-1", 1, 60).await.unwrap();
    let run = &claimed[0];

    // RUNNING implies both an owner and a live lease.
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.locked_by.as_deref(), Some("worker-1"));
    assert!(run.lease_expires_at.unwrap() > Utc::now());
    assert!(run.locked_at.is_some());
    assert!(run.started_at.is_some());

    // A second claim finds nothing while the lease is live.
    let contended = claim_runs(&ctx.db_pool, "worker-2", 1, 60).await.unwrap();
    assert!(contended.is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn expired_lease_is_reclaimed_before_fresh_work(ctx: &mut TestHarness) {
    let zombie = enqueue_run(
        &ctx.db_pool,
        "core.test.echo@v1",
        json!({}),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();
    claim_runs(&ctx.db_pool, "worker-dead", 1, 1).await.unwrap();

    let fresh = enqueue_run(
        &ctx.db_pool,
        "core.test.echo@v1",
        json!({}),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    // Same priority: the expired RUNNING row is taken first.
    let claimed = claim_runs(&ctx.db_pool, "worker-2", 1, 60).await.unwrap();
    assert_eq!(claimed[0].id, zombie.id);
    assert_eq!(claimed[0].locked_by.as_deref(), Some("worker-2"));

    let claimed = claim_runs(&ctx.db_pool, "worker-2", 1, 60).await.unwrap();
    assert_eq!(claimed[0].id, fresh.id);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn renew_lease_is_ownership_guarded(ctx: &mut TestHarness) {
    let run = enqueue_run(
        &ctx.db_pool,
        "core.test.echo@v1",
        json!({}),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();
    claim_runs(&ctx.db_pool, "worker-1", 1, 60).await.unwrap();

    assert!(renew_lease(&ctx.db_pool, run.id, "worker-1", 60).await.unwrap());
    assert!(!renew_lease(&ctx.db_pool, run.id, "worker-2", 60).await.unwrap());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn cancel_covers_queued_only_and_is_terminal(ctx: &mut TestHarness) {
    let run = enqueue_run(
        &ctx.db_pool,
        "core.test.echo@v1",
        json!({}),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();

    assert!(cancel_run(&ctx.db_pool, run.id).await.unwrap());
    // Already terminal: the second cancel is a no-op.
    assert!(!cancel_run(&ctx.db_pool, run.id).await.unwrap());

    // Cancelled runs never come back out of the queue.
    let claimed = claim_runs(&ctx.db_pool, "worker-1", 10, 60).await.unwrap();
    assert!(claimed.is_empty());

    let running = enqueue_run(
        &ctx.db_pool,
        "core.test.echo@v1",
        json!({}),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();
    claim_runs(&ctx.db_pool, "worker-1", 1, 60).await.unwrap();
    assert!(!cancel_run(&ctx.db_pool, running.id).await.unwrap());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn enqueue_generates_correlation_id(ctx: &mut TestHarness) {
    let run = enqueue_run(
        &ctx.db_pool,
        "core.test.echo@v1",
        json!({}),
        EnqueueOptions::default(),
    )
    .await
    .unwrap();
    assert!(!run.correlation_id.is_empty());

    let threaded = enqueue_run(
        &ctx.db_pool,
        "core.test.echo@v1",
        json!({}),
        EnqueueOptions::builder().correlation_id("corr-42").build(),
    )
    .await
    .unwrap();
    assert_eq!(threaded.correlation_id, "corr-42");
}
