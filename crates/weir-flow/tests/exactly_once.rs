//! Exactly-once consumption through the lease layer.

use std::time::Duration;

use futures::future::join_all;
use weir_flow::dispatch::record::DispatchState;
use weir_flow::dispatch::DispatchOutcome;
use weir_flow::{AcquireResult, ConsumptionResult};
use weir_test_utils::fixtures::{arc_id, boundary_id, fast_config, lot_key};
use weir_test_utils::{object_record, TestContext, TopologyBuilder, TracingMemoryBackend};

const TTL: Duration = Duration::from_secs(30);

fn topology() -> std::sync::Arc<weir_flow::topology::Topology> {
    TopologyBuilder::new()
        .count_boundary("raw", "raw/{date}", 1)
        .count_boundary("clean", "clean/{date}", 1)
        .arc("cleanse", "raw", &["clean"])
        .build()
}

async fn completed_context(storage: TracingMemoryBackend) -> TestContext {
    let ctx = TestContext::with_storage(topology(), fast_config(), storage);
    let report = ctx
        .deliver(&[object_record("e1", "raw", "raw/2024-01-01/a.csv")])
        .await;
    assert_eq!(report.completed().count(), 1);
    ctx
}

async fn acquire(ctx: &TestContext, holder: &str) -> AcquireResult {
    ctx.engine
        .leases()
        .acquire(
            &arc_id("cleanse"),
            &boundary_id("raw"),
            &lot_key("2024-01-01"),
            holder,
            TTL,
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn concurrent_workers_get_one_lease() {
    let ctx = completed_context(TracingMemoryBackend::with_latency(Duration::from_millis(1))).await;

    let holders: Vec<String> = (0..16).map(|i| format!("worker-{i}")).collect();
    let results = join_all(holders.iter().map(|holder| acquire(&ctx, holder))).await;

    let leases: Vec<_> = results
        .iter()
        .filter_map(|r| match r {
            AcquireResult::Leased(lease) => Some(lease.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(leases.len(), 1);
    assert!(results.iter().all(|r| matches!(
        r,
        AcquireResult::Leased(_) | AcquireResult::AlreadyLeased { .. }
    )));

    let lease = &leases[0];
    assert_eq!(
        ctx.engine.leases().release_consumed(lease).await.unwrap(),
        ConsumptionResult::Recorded
    );

    let after = join_all(holders.iter().map(|holder| acquire(&ctx, holder))).await;
    assert!(after
        .iter()
        .all(|r| matches!(r, AcquireResult::AlreadyConsumed)));
}

#[tokio::test]
async fn lapsed_lease_is_taken_over_and_consumed_once() {
    let ctx = completed_context(TracingMemoryBackend::new()).await;

    let mut first = acquire(&ctx, "worker-a").await.into_lease().unwrap();
    assert!(matches!(
        acquire(&ctx, "worker-b").await,
        AcquireResult::AlreadyLeased { ref holder_id, .. } if holder_id == "worker-a"
    ));

    ctx.clock.advance(TTL + Duration::from_secs(1));
    let second = acquire(&ctx, "worker-b").await.into_lease().unwrap();
    assert!(second.fencing_sequence > first.fencing_sequence);
    assert!(!ctx.engine.leases().renew(&mut first, TTL).await.unwrap());

    // The stale holder finishing late still counts as the one consumption.
    assert_eq!(
        ctx.engine.leases().release_consumed(&first).await.unwrap(),
        ConsumptionResult::Recorded
    );
    assert_eq!(
        ctx.engine.leases().release_consumed(&second).await.unwrap(),
        ConsumptionResult::AlreadyConsumed
    );
    assert!(matches!(
        acquire(&ctx, "worker-c").await,
        AcquireResult::AlreadyConsumed
    ));
}

#[tokio::test]
async fn sweep_retriggers_a_lapsed_lease() {
    let ctx = completed_context(TracingMemoryBackend::new()).await;
    assert_eq!(ctx.trigger_count(), 1);

    let lease = acquire(&ctx, "worker-a").await.into_lease().unwrap();
    let before = ctx.engine.sweep().await;
    assert!(before.redriven.is_empty());

    ctx.clock.advance(TTL + Duration::from_secs(1));
    let report = ctx.engine.sweep().await;
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.redriven.len(), 1);
    assert!(matches!(report.redriven[0], DispatchOutcome::Dispatched { .. }));
    assert_eq!(ctx.trigger_count(), 2);

    let record = ctx
        .engine
        .leases()
        .inspect(&arc_id("cleanse"), &boundary_id("raw"), &lot_key("2024-01-01"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, DispatchState::Dispatched);
    assert!(record.lease.is_none());

    let retry = acquire(&ctx, "worker-b").await.into_lease().unwrap();
    assert!(retry.fencing_sequence > lease.fencing_sequence);
    ctx.engine.leases().release_consumed(&retry).await.unwrap();

    let later = ctx.engine.sweep().await;
    assert!(later.redriven.is_empty());
    assert_eq!(ctx.trigger_count(), 2);
}

#[tokio::test]
async fn abandoned_lease_can_be_reacquired() {
    let ctx = completed_context(TracingMemoryBackend::new()).await;

    let lease = acquire(&ctx, "worker-a").await.into_lease().unwrap();
    assert!(ctx.engine.leases().abandon(&lease).await.unwrap());
    assert!(!ctx.engine.leases().abandon(&lease).await.unwrap());

    let next = acquire(&ctx, "worker-b").await.into_lease().unwrap();
    assert_eq!(next.holder_id, "worker-b");
    assert_eq!(
        ctx.engine.leases().release_consumed(&next).await.unwrap(),
        ConsumptionResult::Recorded
    );
}

#[tokio::test]
async fn abandoned_lease_is_retriggered_by_the_sweep() {
    let ctx = completed_context(TracingMemoryBackend::new()).await;
    assert_eq!(ctx.trigger_count(), 1);

    let lease = acquire(&ctx, "worker-a").await.into_lease().unwrap();
    assert!(ctx.engine.leases().abandon(&lease).await.unwrap());

    ctx.clock.advance(Duration::from_secs(3600));
    let report = ctx.engine.sweep().await;
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.redriven.len(), 1);
    assert!(matches!(report.redriven[0], DispatchOutcome::Dispatched { .. }));
    assert_eq!(ctx.trigger_count(), 2);

    let record = ctx
        .engine
        .leases()
        .inspect(&arc_id("cleanse"), &boundary_id("raw"), &lot_key("2024-01-01"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, DispatchState::Dispatched);

    let again = ctx.engine.sweep().await;
    assert!(again.redriven.is_empty());
    assert_eq!(ctx.trigger_count(), 2);

    let next = acquire(&ctx, "worker-b").await.into_lease().unwrap();
    assert!(next.fencing_sequence > lease.fencing_sequence);
    assert_eq!(
        ctx.engine.leases().release_consumed(&next).await.unwrap(),
        ConsumptionResult::Recorded
    );
}

#[tokio::test]
async fn completion_replay_retriggers_an_abandoned_lot() {
    let ctx = completed_context(TracingMemoryBackend::new()).await;
    let lease = acquire(&ctx, "worker-a").await.into_lease().unwrap();
    assert!(ctx.engine.leases().abandon(&lease).await.unwrap());

    let manifest = ctx
        .engine
        .manifests()
        .get(&boundary_id("raw"), &lot_key("2024-01-01"))
        .await
        .unwrap()
        .unwrap();
    let outcomes = ctx.engine.dispatcher().dispatch_completion(&manifest).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], DispatchOutcome::Dispatched { .. }));
    assert_eq!(ctx.trigger_count(), 2);

    let replay = ctx.engine.dispatcher().dispatch_completion(&manifest).await.unwrap();
    assert!(matches!(
        replay[0],
        DispatchOutcome::Deduplicated {
            state: DispatchState::Dispatched,
            ..
        }
    ));
    assert_eq!(ctx.trigger_count(), 2);
}
