//! End-to-end flows: notifications in, one trigger per arc and lot out.

use std::collections::BTreeSet;
use std::time::Duration;

use weir_flow::dispatch::record::DispatchState;
use weir_flow::dispatch::DispatchOutcome;
use weir_flow::manifest::ManifestState;
use weir_flow::{
    AcquireResult, ArcState, ConsumptionResult, Error, EventOutcome, Lease, SinkOutput,
};
use weir_test_utils::fixtures::{arc_id, boundary_id, lot_key};
use weir_test_utils::{object_record, StorageOp, TestContext, TopologyBuilder};

#[tokio::test]
async fn scrambled_duplicate_notifications_trigger_each_arc_once_per_lot() {
    let ctx = TestContext::new(
        TopologyBuilder::new()
            .count_boundary("raw", "raw/{date}", 2)
            .count_boundary("clean", "clean/{date}", 1)
            .arc("audit", "raw", &[])
            .arc("cleanse", "raw", &["clean"])
            .build(),
    );

    let records = vec![
        object_record("d2-b", "raw", "raw/2024-01-02/b.csv"),
        object_record("d1-a", "raw", "raw/2024-01-01/a.csv"),
        object_record("d1-a", "raw", "raw/2024-01-01/a.csv"),
        object_record("d2-b-again", "raw", "raw/2024-01-02/b.csv"),
        object_record("d1-a", "raw", "raw/2024-01-01/a.csv"),
        object_record("d2-a", "raw", "raw/2024-01-02/a.csv"),
        object_record("d1-b", "raw", "raw/2024-01-01/b.csv"),
        object_record("d2-a", "raw", "raw/2024-01-02/a.csv"),
        object_record("d1-b-again", "raw", "raw/2024-01-01/b.csv"),
    ];
    let mut completed = 0;
    for batch in records.chunks(3) {
        let report = ctx.deliver(batch).await;
        assert!(report.failed.is_empty());
        completed += report.completed().count();
    }
    assert_eq!(completed, 2);

    let manifests = ctx.engine.manifests().list(&boundary_id("raw")).await.unwrap();
    let lots: Vec<String> = manifests.iter().map(|m| m.lot_key.to_string()).collect();
    assert_eq!(lots, vec!["2024-01-01", "2024-01-02"]);
    assert!(manifests.iter().all(|m| m.object_paths.len() == 2));

    let invocations = ctx.target.invocations().unwrap();
    assert_eq!(invocations.len(), 4);
    let keys: BTreeSet<&str> = invocations
        .iter()
        .map(|p| p.idempotency_key.as_str())
        .collect();
    assert_eq!(keys.len(), 4);

    for payload in &invocations {
        let lease = ctx
            .engine
            .leases()
            .acquire(
                &payload.arc_id,
                &payload.boundary_id,
                &payload.lot_key,
                "worker",
                Duration::from_secs(60),
            )
            .await
            .unwrap()
            .into_lease()
            .unwrap();
        assert_eq!(
            ctx.engine.leases().release_consumed(&lease).await.unwrap(),
            ConsumptionResult::Recorded
        );
    }
    for payload in &invocations {
        let again = ctx
            .engine
            .leases()
            .acquire(
                &payload.arc_id,
                &payload.boundary_id,
                &payload.lot_key,
                "worker",
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(again, AcquireResult::AlreadyConsumed);
    }
}

#[tokio::test]
async fn exhausted_dispatch_lands_in_operator_queue_until_redriven() {
    let ctx = TestContext::new(
        TopologyBuilder::new()
            .count_boundary("raw", "raw/{date}", 1)
            .count_boundary("clean", "clean/{date}", 1)
            .arc("cleanse", "raw", &["clean"])
            .build(),
    );
    ctx.target.fail_next(3).unwrap();

    let report = ctx
        .deliver(&[object_record("e1", "raw", "raw/2024-01-01/a.csv")])
        .await;
    let dispatches: Vec<&DispatchOutcome> = report.dispatches().collect();
    assert!(matches!(
        dispatches[..],
        [DispatchOutcome::Failed { attempts: 3, .. }]
    ));

    let queue = ctx.engine.dispatcher().failed_dispatches();
    let failed = queue.list().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].arc_id, arc_id("cleanse"));
    assert_eq!(failed[0].attempts, 3);
    assert!(!failed[0].last_error.is_empty());
    assert_eq!(ctx.engine.sweep().await.failed_dispatches, 1);

    // Redelivery of the notification does not re-dispatch a failed arc.
    let redelivered = ctx
        .deliver(&[object_record("e2", "raw", "raw/2024-01-01/a.csv")])
        .await;
    assert_eq!(redelivered.count("already_complete"), 1);
    assert_eq!(ctx.trigger_count(), 0);

    let outcome = ctx
        .engine
        .dispatcher()
        .redrive(&arc_id("cleanse"), &boundary_id("raw"), &lot_key("2024-01-01"))
        .await
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::Dispatched { attempts: 1, .. }));
    assert!(queue.list().await.unwrap().is_empty());
    assert_eq!(ctx.engine.sweep().await.failed_dispatches, 0);
}

#[tokio::test]
async fn consuming_a_failed_dispatch_clears_its_operator_entry() {
    let ctx = TestContext::new(
        TopologyBuilder::new()
            .count_boundary("raw", "raw/{date}", 1)
            .count_boundary("clean", "clean/{date}", 1)
            .arc("cleanse", "raw", &["clean"])
            .build(),
    );
    ctx.target.fail_next(3).unwrap();
    ctx.deliver(&[object_record("e1", "raw", "raw/2024-01-01/a.csv")])
        .await;
    let queue = ctx.engine.dispatcher().failed_dispatches();
    assert_eq!(queue.list().await.unwrap().len(), 1);

    let lease = ctx
        .engine
        .leases()
        .acquire(
            &arc_id("cleanse"),
            &boundary_id("raw"),
            &lot_key("2024-01-01"),
            "worker-a",
            Duration::from_secs(60),
        )
        .await
        .unwrap()
        .into_lease()
        .unwrap();
    assert_eq!(
        ctx.engine.leases().release_consumed(&lease).await.unwrap(),
        ConsumptionResult::Recorded
    );

    assert!(queue.list().await.unwrap().is_empty());
    assert_eq!(ctx.engine.sweep().await.failed_dispatches, 0);
}

fn two_hop_context() -> TestContext {
    TestContext::new(
        TopologyBuilder::new()
            .count_boundary("raw", "raw/{date}", 1)
            .count_boundary("clean", "clean/{date}", 2)
            .count_boundary("published", "published/{date}", 1)
            .arc("cleanse", "raw", &["clean"])
            .arc("publish", "clean", &["published"])
            .build(),
    )
}

async fn lease_cleanse(ctx: &TestContext) -> Lease {
    ctx.engine
        .leases()
        .acquire(
            &arc_id("cleanse"),
            &boundary_id("raw"),
            &lot_key("2024-01-01"),
            "worker-a",
            Duration::from_secs(60),
        )
        .await
        .unwrap()
        .into_lease()
        .unwrap()
}

fn clean_output(state: ManifestState) -> Vec<SinkOutput> {
    vec![SinkOutput::new(
        boundary_id("clean"),
        state,
        vec!["clean/2024-01-01/a.parquet".to_string()],
    )]
}

#[tokio::test]
async fn finished_arc_closes_its_sink_lot_and_triggers_downstream() {
    let ctx = two_hop_context();
    ctx.deliver(&[object_record("e1", "raw", "raw/2024-01-01/a.csv")])
        .await;
    assert_eq!(ctx.trigger_count(), 1);

    let lease = lease_cleanse(&ctx).await;
    let completion = ctx
        .engine
        .complete_arc(&lease, clean_output(ManifestState::Complete))
        .await
        .unwrap();
    assert_eq!(completion.state, ArcState::Complete);
    assert_eq!(completion.consumption, ConsumptionResult::Recorded);
    assert_eq!(completion.sink_manifests.len(), 1);
    assert_eq!(completion.sink_manifests[0].boundary_id, boundary_id("clean"));
    assert_eq!(completion.sink_manifests[0].lot_key, lot_key("2024-01-01"));
    assert!(matches!(
        completion.dispatches[..],
        [DispatchOutcome::Dispatched { .. }]
    ));

    let invocations = ctx.target.invocations().unwrap();
    assert_eq!(invocations.len(), 2);
    assert_eq!(invocations[1].arc_id, arc_id("publish"));
    assert_eq!(invocations[1].boundary_id, boundary_id("clean"));
    assert_eq!(
        invocations[1].manifest_ref,
        completion.sink_manifests[0].manifest_ref()
    );

    // A retried report changes nothing.
    let retry = ctx
        .engine
        .complete_arc(&lease, clean_output(ManifestState::Complete))
        .await
        .unwrap();
    assert_eq!(retry.consumption, ConsumptionResult::AlreadyConsumed);
    assert!(matches!(
        retry.dispatches[..],
        [DispatchOutcome::Deduplicated { .. }]
    ));
    assert_eq!(ctx.trigger_count(), 2);

    // The storage notification for the sink object finds its lot closed.
    let report = ctx
        .deliver(&[object_record("c1", "clean", "clean/2024-01-01/a.parquet")])
        .await;
    assert!(matches!(
        report.outcomes[0].outcome,
        EventOutcome::AlreadyComplete { late_arrival: false, .. }
    ));
    assert_eq!(ctx.trigger_count(), 2);
}

#[tokio::test]
async fn partial_sink_marks_the_arc_partial() {
    let ctx = two_hop_context();
    ctx.deliver(&[object_record("e1", "raw", "raw/2024-01-01/a.csv")])
        .await;
    let lease = lease_cleanse(&ctx).await;

    let completion = ctx
        .engine
        .complete_arc(&lease, clean_output(ManifestState::Partial))
        .await
        .unwrap();
    assert_eq!(completion.state, ArcState::Partial);
    assert_eq!(completion.sink_manifests[0].state, ManifestState::Partial);
    assert_eq!(ctx.trigger_count(), 2);
}

#[tokio::test]
async fn arc_result_must_name_every_declared_sink_once() {
    let ctx = two_hop_context();
    ctx.deliver(&[object_record("e1", "raw", "raw/2024-01-01/a.csv")])
        .await;
    let lease = lease_cleanse(&ctx).await;

    let undeclared = vec![SinkOutput::new(
        boundary_id("published"),
        ManifestState::Complete,
        vec![],
    )];
    let mut twice = clean_output(ManifestState::Complete);
    twice.extend(clean_output(ManifestState::Complete));
    for sinks in [Vec::new(), undeclared, twice] {
        let err = ctx.engine.complete_arc(&lease, sinks).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArcResult { .. }), "{err}");
    }

    // Nothing was written and the lease still holds the lot.
    assert!(ctx
        .engine
        .manifests()
        .get(&boundary_id("clean"), &lot_key("2024-01-01"))
        .await
        .unwrap()
        .is_none());
    let record = ctx
        .engine
        .leases()
        .inspect(&arc_id("cleanse"), &boundary_id("raw"), &lot_key("2024-01-01"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, DispatchState::Leased);
    assert_eq!(ctx.trigger_count(), 1);
}

#[tokio::test]
async fn join_arc_waits_for_every_input_lot() {
    let ctx = TestContext::new(
        TopologyBuilder::new()
            .count_boundary("raw", "raw/{date}", 1)
            .count_boundary("ref", "ref/{date}", 1)
            .count_boundary("joined", "joined/{date}", 1)
            .join_arc("enrich", "raw", &["ref"], &["joined"])
            .build(),
    );

    let report = ctx
        .deliver(&[object_record("e1", "raw", "raw/2024-01-01/a.csv")])
        .await;
    assert!(matches!(
        report.dispatches().collect::<Vec<_>>()[..],
        [DispatchOutcome::Waiting { missing, .. }] if *missing == vec![boundary_id("ref")]
    ));
    assert_eq!(ctx.trigger_count(), 0);

    let report = ctx
        .deliver(&[object_record("e2", "ref", "ref/2024-01-01/lookup.csv")])
        .await;
    assert_eq!(report.count("completed"), 1);
    assert_eq!(ctx.trigger_count(), 1);

    let payload = &ctx.target.invocations().unwrap()[0];
    assert_eq!(payload.boundary_id, boundary_id("raw"));
    assert!(payload.input_manifests.contains_key(&boundary_id("ref")));

    // A different lot on one input alone does not trigger.
    ctx.deliver(&[object_record("e3", "ref", "ref/2024-01-02/lookup.csv")])
        .await;
    assert_eq!(ctx.trigger_count(), 1);
}

#[tokio::test]
async fn transient_store_failures_are_retried_within_the_event() {
    let ctx = TestContext::new(
        TopologyBuilder::new()
            .count_boundary("raw", "raw/{date}", 1)
            .count_boundary("clean", "clean/{date}", 1)
            .arc("cleanse", "raw", &["clean"])
            .build(),
    );
    ctx.storage.inject_failures("manifests/", 2);

    let report = ctx
        .deliver(&[object_record("e1", "raw", "raw/2024-01-01/a.csv")])
        .await;
    assert!(report.failed.is_empty());
    assert_eq!(report.completed().count(), 1);
    assert_eq!(ctx.trigger_count(), 1);

    let manifest_writes = ctx
        .storage
        .operations()
        .iter()
        .filter(|op| op.is_conditional_put_under("manifests/"))
        .count();
    assert_eq!(manifest_writes, 1);
}

#[tokio::test]
async fn persistent_store_failure_is_reported_retryable_and_recovers_on_redelivery() {
    let ctx = TestContext::new(
        TopologyBuilder::new()
            .count_boundary("raw", "raw/{date}", 1)
            .count_boundary("clean", "clean/{date}", 1)
            .arc("cleanse", "raw", &["clean"])
            .build(),
    );
    ctx.storage.inject_failure("lots/");

    let record = object_record("e1", "raw", "raw/2024-01-01/a.csv");
    let report = ctx.deliver(std::slice::from_ref(&record)).await;
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].retryable);
    assert_eq!(
        report.retryable_event_ids().map(ToString::to_string).collect::<Vec<_>>(),
        vec!["e1"]
    );
    assert_eq!(ctx.trigger_count(), 0);

    ctx.storage.clear_failures();
    let report = ctx.deliver(&[record]).await;
    assert!(matches!(
        report.outcomes[0].outcome,
        EventOutcome::Completed { .. }
    ));
    assert_eq!(ctx.trigger_count(), 1);
    assert!(ctx
        .storage
        .operations()
        .iter()
        .any(|op| matches!(op, StorageOp::Put { path, .. } if path.starts_with("events/"))));
}
