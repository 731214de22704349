use crate::config::ThresholdConfig;
use crate::error::{RateWatchError, Result};
use crate::pipeline::alerts::ThresholdEvaluator;
use crate::pipeline::broadcast::Broadcaster;
use crate::pipeline::fetcher::RateFetcher;
use crate::pipeline::ledger::{Ledger, LedgerEntry};
use chrono::{DateTime, Days, Duration as ChronoDuration, Local, NaiveTime, TimeZone};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Fetching,
    Evaluating,
    Storing,
    /// Cache write and `ratesUpdate` fan-out, done as one step.
    Publishing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Fetching => "fetching",
            Stage::Evaluating => "evaluating",
            Stage::Storing => "storing",
            Stage::Publishing => "publishing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Scheduled,
    OnDemand,
}

/// Resets the stage to `Idle` however the run ends.
struct StageGuard<'a>(&'a Pipeline);

impl StageGuard<'_> {
    fn enter(&self, stage: Stage) {
        debug!("Pipeline stage: {}", stage);
        *self.0.stage.lock().unwrap_or_else(|p| p.into_inner()) = stage;
        #[cfg(test)]
        self.0
            .trace
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(stage);
    }
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        self.enter(Stage::Idle);
    }
}

/// fetch -> evaluate -> store -> cache -> broadcast, at most one run at a time.
pub struct Pipeline {
    fetcher: RateFetcher,
    evaluator: ThresholdEvaluator,
    ledger: Arc<Ledger>,
    broadcaster: Arc<Broadcaster>,
    thresholds: Arc<ThresholdConfig>,
    in_flight: tokio::sync::Mutex<()>,
    stage: Mutex<Stage>,
    #[cfg(test)]
    trace: Mutex<Vec<Stage>>,
}

impl Pipeline {
    pub fn new(
        fetcher: RateFetcher,
        evaluator: ThresholdEvaluator,
        ledger: Arc<Ledger>,
        broadcaster: Arc<Broadcaster>,
        thresholds: Arc<ThresholdConfig>,
    ) -> Self {
        Self {
            fetcher,
            evaluator,
            ledger,
            broadcaster,
            thresholds,
            in_flight: tokio::sync::Mutex::new(()),
            stage: Mutex::new(Stage::Idle),
            #[cfg(test)]
            trace: Mutex::new(Vec::new()),
        }
    }

    pub fn stage(&self) -> Stage {
        *self.stage.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Runs the whole pipeline once and returns the stored entry.
    ///
    /// Overlapping calls fail with [`RateWatchError::PipelineBusy`]. Alerts already sent
    /// stay sent when a later step fails.
    pub async fn run(&self, trigger: Trigger) -> Result<LedgerEntry> {
        let _flight = self
            .in_flight
            .try_lock()
            .map_err(|_| RateWatchError::PipelineBusy)?;
        let stage = StageGuard(self);
        info!("Pipeline run started ({:?})", trigger);

        stage.enter(Stage::Fetching);
        let snapshot = self.fetcher.fetch(&self.thresholds).await?;

        stage.enter(Stage::Evaluating);
        let outcomes = self.evaluator.evaluate(&snapshot, &self.thresholds).await;
        let unsent = outcomes.iter().filter(|o| !o.notified).count();
        if unsent > 0 {
            warn!("{} of {} alert emails were not delivered", unsent, outcomes.len());
        }

        stage.enter(Stage::Storing);
        let entry = self.ledger.store(&snapshot).await?;

        stage.enter(Stage::Publishing);
        let stored = entry.snapshot()?;
        let delivered = self.broadcaster.publish_latest(stored);

        info!(
            "Pipeline run finished: entry {}, {} breaches, {} subscribers updated",
            entry.id,
            outcomes.len(),
            delivered
        );
        Ok(entry)
    }
}

/// Next local occurrence of `at` strictly after `now`.
pub fn next_run_after<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();
    // Two extra days cover a skipped local time on a DST switch.
    (0..3)
        .filter_map(|offset| today.checked_add_days(Days::new(offset)))
        .filter_map(|day| tz.from_local_datetime(&day.and_time(at)).earliest())
        .find(|candidate| candidate > now)
        .unwrap_or_else(|| now.clone() + ChronoDuration::days(1))
}

/// Daily, startup, and on-demand triggers for [`Pipeline::run`].
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    at: NaiveTime,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, at: NaiveTime) -> Self {
        Self { pipeline, at }
    }

    pub fn stage(&self) -> Stage {
        self.pipeline.stage()
    }

    /// On-demand trigger; the error goes back to the caller.
    pub async fn trigger(&self) -> Result<LedgerEntry> {
        self.pipeline.run(Trigger::OnDemand).await
    }

    async fn run_logged(&self, trigger: Trigger) {
        if let Err(e) = self.pipeline.run(trigger).await {
            match trigger {
                Trigger::Startup => {
                    error!("Initial rate fetch failed, will retry on schedule: {}", e)
                }
                _ => error!("Scheduled rate fetch failed: {}", e),
            }
        }
    }

    /// Runs once immediately, then daily at the configured time until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.run_logged(Trigger::Startup).await;

        loop {
            let now = Local::now();
            let next = next_run_after(&now, self.at);
            let wait = (next.clone() - now).to_std().unwrap_or_default();
            info!("Next scheduled rate fetch at {}", next.format("%Y-%m-%d %H:%M:%S"));

            tokio::select! {
                _ = tokio::time::sleep(wait) => self.run_logged(Trigger::Scheduled).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler stopped");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fastforex::rest::QuoteProvider;
    use crate::pipeline::cache::LatestStateCache;
    use crate::pipeline::fetcher::tests::StaticProvider;
    use crate::pipeline::ledger::RETENTION;
    use crate::pipeline::notifier::tests::RecordingTransport;
    use crate::pipeline::notifier::Notifier;
    use crate::pipeline::store::{Document, DocumentStore, MemoryStore, SortOrder};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        pipeline: Arc<Pipeline>,
        broadcaster: Arc<Broadcaster>,
        transport: Arc<RecordingTransport>,
    }

    fn harness(provider: Arc<dyn QuoteProvider>, store: Arc<dyn DocumentStore>) -> Harness {
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::new(LatestStateCache::new()),
            Duration::from_secs(25),
        ));
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Arc::new(Notifier::new(transport.clone(), "a@b".into(), "c@d".into()));
        let pipeline = Arc::new(Pipeline::new(
            RateFetcher::new(provider),
            ThresholdEvaluator::new(notifier, broadcaster.clone()),
            Arc::new(Ledger::new(store)),
            broadcaster.clone(),
            Arc::new(ThresholdConfig::default()),
        ));
        Harness {
            pipeline,
            broadcaster,
            transport,
        }
    }

    #[tokio::test]
    async fn full_run_stores_caches_and_broadcasts() {
        let h = harness(
            Arc::new(StaticProvider::lkr_quotes()),
            Arc::new(MemoryStore::new()),
        );
        let mut sub = h.broadcaster.subscribe();

        let entry = h.pipeline.run(Trigger::OnDemand).await.unwrap();
        assert_eq!(entry.values["USD"], 330.03);
        assert_eq!(entry.values["EUR"], 781.25);
        assert_eq!(entry.values["GBP"], 900.9);
        assert_eq!(h.pipeline.stage(), Stage::Idle);
        assert_eq!(h.transport.sent.lock().unwrap().len(), 3);
        assert_eq!(
            *h.pipeline.trace.lock().unwrap(),
            vec![
                Stage::Fetching,
                Stage::Evaluating,
                Stage::Storing,
                Stage::Publishing,
                Stage::Idle,
            ]
        );

        let cached = h.broadcaster.cache().current().unwrap();
        assert_eq!(cached.snapshot.rate("USD"), Some(330.03));

        let mut kinds = Vec::new();
        for _ in 0..5 {
            let frame = sub.recv().await.unwrap();
            let event: Value = serde_json::from_str(&frame).unwrap();
            kinds.push(event["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec!["connected", "alert", "alert", "alert", "ratesUpdate"]
        );
    }

    #[tokio::test]
    async fn fetch_failure_leaves_cache_untouched() {
        let store = Arc::new(MemoryStore::new());
        let h = harness(Arc::new(StaticProvider::failing()), store.clone());

        let err = h.pipeline.run(Trigger::OnDemand).await.unwrap_err();
        assert!(matches!(err, RateWatchError::Fetch(_)));
        assert_eq!(h.pipeline.stage(), Stage::Idle);
        assert!(h.broadcaster.cache().current().is_none());
        assert_eq!(store.len(), 0);
    }

    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        async fn append(&self, _order_key: DateTime<Utc>, _body: Value) -> crate::error::Result<Document> {
            Err(RateWatchError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        async fn query(&self, _order: SortOrder, _limit: Option<usize>) -> crate::error::Result<Vec<Document>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _id: &str) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn store_failure_keeps_sent_alerts_but_skips_cache() {
        let h = harness(Arc::new(StaticProvider::lkr_quotes()), Arc::new(BrokenStore));

        let err = h.pipeline.run(Trigger::Scheduled).await.unwrap_err();
        assert!(matches!(err, RateWatchError::Store(_)));
        assert_eq!(h.transport.sent.lock().unwrap().len(), 3);
        assert!(h.broadcaster.cache().current().is_none());
        assert_eq!(h.pipeline.stage(), Stage::Idle);
    }

    /// Provider that parks until released, to hold a run in flight.
    struct GatedProvider {
        inner: StaticProvider,
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl QuoteProvider for GatedProvider {
        async fn fetch_multi(&self, base: &str, targets: &[&str]) -> crate::error::Result<HashMap<String, f64>> {
            self.gate.notified().await;
            self.inner.fetch_multi(base, targets).await
        }
    }

    #[tokio::test]
    async fn overlapping_trigger_is_rejected() {
        let provider = Arc::new(GatedProvider {
            inner: StaticProvider::lkr_quotes(),
            gate: tokio::sync::Notify::new(),
        });
        let h = harness(provider.clone(), Arc::new(MemoryStore::new()));

        let first = {
            let pipeline = h.pipeline.clone();
            tokio::spawn(async move { pipeline.run(Trigger::Scheduled).await })
        };
        while h.pipeline.stage() != Stage::Fetching {
            tokio::task::yield_now().await;
        }

        let second = h.pipeline.run(Trigger::OnDemand).await;
        assert!(matches!(second, Err(RateWatchError::PipelineBusy)));

        provider.gate.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_runs_respect_retention() {
        let store = Arc::new(MemoryStore::new());
        let h = harness(Arc::new(StaticProvider::lkr_quotes()), store.clone());
        let scheduler = Scheduler::new(h.pipeline.clone(), NaiveTime::from_hms_opt(9, 0, 0).unwrap());

        for _ in 0..(RETENTION + 3) {
            scheduler.trigger().await.unwrap();
            // Distinct capture instants.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(store.len(), RETENTION);
    }

    #[test]
    fn next_run_is_today_or_tomorrow() {
        let at = NaiveTime::from_hms_opt(9, 0, 0).unwrap();

        let before = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();
        assert_eq!(
            next_run_after(&before, at),
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
        );

        let exactly = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        assert_eq!(
            next_run_after(&exactly, at),
            Utc.with_ymd_and_hms(2024, 6, 2, 9, 0, 0).unwrap()
        );

        let after = Utc.with_ymd_and_hms(2024, 12, 31, 23, 0, 0).unwrap();
        assert_eq!(
            next_run_after(&after, at),
            Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_runs_at_startup_and_stops_on_shutdown() {
        let provider = Arc::new(StaticProvider::lkr_quotes());
        let h = harness(provider.clone(), Arc::new(MemoryStore::new()));
        let scheduler = Arc::new(Scheduler::new(
            h.pipeline.clone(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        ));
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(scheduler.run(rx));
        while h.broadcaster.cache().current().is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
