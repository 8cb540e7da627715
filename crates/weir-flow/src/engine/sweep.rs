//! Periodic maintenance.
//!
//! Event processing alone cannot finish everything: time-based policies close
//! lots when nothing happens, a crash between the manifest write and dispatch
//! leaves a manifest without dispatch records, and a worker that dies while
//! holding a lease (or gives it up) leaves a lot that nobody re-triggers.
//! The sweep repairs these and collects garbage. Every step is idempotent, so
//! sweeps may overlap across processes.

use std::time::Instant;

use weir_core::clock::to_chrono;
use weir_core::storage::StorageBackend;

use super::Engine;
use crate::dispatch::record::DispatchState;
use crate::dispatch::DispatchOutcome;
use crate::error::Result;
use crate::manifest::ManifestRecord;
use crate::tracker::Evaluation;

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Open lots re-evaluated.
    pub lots_evaluated: usize,
    /// Lots the sweep closed.
    pub lots_completed: Vec<ManifestRecord>,
    /// Dispatches started for closed lots lacking them.
    pub dispatches: Vec<DispatchOutcome>,
    /// Dispatches re-driven because no worker was on them any more.
    pub redriven: Vec<DispatchOutcome>,
    /// Completed lots whose state and observed objects were deleted.
    pub lots_collected: usize,
    /// Consumed dispatch records deleted.
    pub records_collected: usize,
    /// Event markers deleted.
    pub markers_purged: usize,
    /// Failed dispatches awaiting operators.
    pub failed_dispatches: usize,
    /// Per-item failures; the sweep carried on past each.
    pub errors: Vec<String>,
}

impl SweepReport {
    fn record_error(&mut self, context: &str, error: &crate::Error) {
        tracing::warn!(context, error = %error, "sweep step failed");
        self.errors.push(format!("{context}: {error}"));
    }
}

impl<S: StorageBackend + ?Sized> Engine<S> {
    /// Runs one maintenance pass. Never fails as a whole.
    pub async fn sweep(&self) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();

        self.sweep_lots(&mut report).await;
        self.sweep_undispatched(&mut report).await;
        self.sweep_dispatch_records(&mut report).await;

        match self.dedup.purge_expired().await {
            Ok(purged) => report.markers_purged = purged,
            Err(e) => report.record_error("purge event markers", &e),
        }
        match self.dispatcher.failed_dispatches().list().await {
            Ok(failed) => {
                report.failed_dispatches = failed.len();
                self.metrics.set_failed_dispatches(failed.len());
            }
            Err(e) => report.record_error("list failed dispatches", &e),
        }

        tracing::info!(
            lots_evaluated = report.lots_evaluated,
            lots_completed = report.lots_completed.len(),
            dispatches = report.dispatches.len(),
            redriven = report.redriven.len(),
            lots_collected = report.lots_collected,
            records_collected = report.records_collected,
            markers_purged = report.markers_purged,
            errors = report.errors.len(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "sweep finished"
        );
        report
    }

    async fn sweep_lots(&self, report: &mut SweepReport) {
        let retention = to_chrono(self.config.lot_retention);
        for boundary in self.topology.boundaries() {
            let lots = match self.tracker.lots(boundary.id()).await {
                Ok(lots) => lots,
                Err(e) => {
                    report.record_error(&format!("list lots of '{}'", boundary.id()), &e);
                    continue;
                }
            };
            let now = self.clock.now();
            for lot in lots {
                if lot.state.is_terminal() {
                    let expired = lot
                        .completed_at
                        .is_some_and(|completed_at| completed_at + retention <= now);
                    if !expired {
                        continue;
                    }
                    match self.tracker.collect_lot(boundary.id(), &lot.lot_key).await {
                        Ok(0) => {}
                        Ok(_) => report.lots_collected += 1,
                        Err(e) => report.record_error(
                            &format!("collect lot '{}' of '{}'", lot.lot_key, boundary.id()),
                            &e,
                        ),
                    }
                    continue;
                }
                report.lots_evaluated += 1;
                let result: Result<()> = async {
                    if let Evaluation::Completed(manifest) =
                        self.tracker.evaluate(boundary, &lot.lot_key).await?
                    {
                        let dispatches = self.dispatcher.dispatch_completion(&manifest).await?;
                        report.dispatches.extend(dispatches);
                        report.lots_completed.push(manifest);
                    }
                    Ok(())
                }
                .await;
                if let Err(e) = result {
                    report.record_error(
                        &format!("evaluate lot '{}' of '{}'", lot.lot_key, boundary.id()),
                        &e,
                    );
                }
            }
        }
    }

    async fn sweep_undispatched(&self, report: &mut SweepReport) {
        let now = self.clock.now();
        let horizon = to_chrono(self.config.dispatch_record_retention);
        for boundary in self.topology.boundaries() {
            if self.topology.subscribers(boundary.id()).is_empty() {
                continue;
            }
            let manifests = match self.manifests.list(boundary.id()).await {
                Ok(manifests) => manifests,
                Err(e) => {
                    report.record_error(&format!("list manifests of '{}'", boundary.id()), &e);
                    continue;
                }
            };
            for manifest in manifests {
                if manifest.completed_at + horizon <= now {
                    continue;
                }
                let result: Result<()> = async {
                    if !self.lacks_dispatch(&manifest).await? {
                        return Ok(());
                    }
                    tracing::warn!(
                        boundary_id = %manifest.boundary_id,
                        lot_key = %manifest.lot_key,
                        "completed lot has undispatched arcs"
                    );
                    let dispatches = self.dispatcher.dispatch_completion(&manifest).await?;
                    report.dispatches.extend(dispatches.into_iter().filter(|outcome| {
                        !matches!(
                            outcome,
                            DispatchOutcome::Deduplicated { .. } | DispatchOutcome::Waiting { .. }
                        )
                    }));
                    Ok(())
                }
                .await;
                if let Err(e) = result {
                    report.record_error(
                        &format!("dispatch lot '{}' of '{}'", manifest.lot_key, manifest.boundary_id),
                        &e,
                    );
                }
            }
        }
    }

    async fn lacks_dispatch(&self, manifest: &ManifestRecord) -> Result<bool> {
        for arc in self.topology.subscribers(&manifest.boundary_id) {
            let records = self.dispatcher.records();
            if records
                .load(arc.id(), arc.source(), &manifest.lot_key)
                .await?
                .is_none()
                && !self
                    .manifests
                    .is_consumed(arc.id(), arc.source(), &manifest.lot_key)
                    .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn sweep_dispatch_records(&self, report: &mut SweepReport) {
        let retention = to_chrono(self.config.dispatch_record_retention);
        for arc in self.topology.arcs() {
            let records = match self.dispatcher.records().list_for_arc(arc.id()).await {
                Ok(records) => records,
                Err(e) => {
                    report.record_error(&format!("list dispatch records of '{}'", arc.id()), &e);
                    continue;
                }
            };
            let now = self.clock.now();
            for found in records {
                let record = found.value;
                let result: Result<()> = async {
                    match record.state {
                        DispatchState::Consumed if record.updated_at + retention <= now => {
                            self.dispatcher.records().delete(&record).await?;
                            report.records_collected += 1;
                        }
                        DispatchState::Pending if self.dispatcher.is_stale(&record, now) => {
                            let outcome = self
                                .dispatcher
                                .redrive(&record.arc_id, &record.boundary_id, &record.lot_key)
                                .await?;
                            report.redriven.push(outcome);
                        }
                        DispatchState::Abandoned => {
                            tracing::info!(
                                arc_id = %record.arc_id,
                                lot_key = %record.lot_key,
                                "lease was abandoned; re-triggering"
                            );
                            let outcome = self
                                .dispatcher
                                .redrive(&record.arc_id, &record.boundary_id, &record.lot_key)
                                .await?;
                            report.redriven.push(outcome);
                        }
                        DispatchState::Leased if record.lease_expired(now) => {
                            tracing::warn!(
                                arc_id = %record.arc_id,
                                lot_key = %record.lot_key,
                                "lease lapsed without release; re-triggering"
                            );
                            let outcome = self
                                .dispatcher
                                .redrive(&record.arc_id, &record.boundary_id, &record.lot_key)
                                .await?;
                            report.redriven.push(outcome);
                        }
                        _ => {}
                    }
                    Ok(())
                }
                .await;
                if let Err(e) = result {
                    report.record_error(
                        &format!("maintain dispatch '{}' lot '{}'", record.arc_id, record.lot_key),
                        &e,
                    );
                }
            }
        }
    }
}
