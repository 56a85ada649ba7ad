//! Periodic poll, aggregate and publish loop
//!
//! Each tick takes one snapshot. Aggregation runs in its own task so a slow
//! directory never delays the next tick; at most `max_in_flight_polls` of
//! those tasks may be outstanding. Finished intervals come back to the
//! driver, which hands them to sinks through a bounded channel; they are
//! dropped, not queued, when the channel is full.

use crate::config::Config;
use crate::ebpf::CounterSource;
use crate::k8s::IdentityResolver;
use crate::metrics::{AggregatedInterval, FlowAggregator, MetricsSink};
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shortest accepted polling interval
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Polling,
    Aggregating,
    Publishing,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub max_in_flight_polls: usize,
    pub sink_buffer: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_in_flight_polls: 2,
            sink_buffer: 4,
        }
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_in_flight_polls: config.max_in_flight_polls,
            sink_buffer: config.sink_buffer,
        }
    }
}

/// Totals for one `run`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub ticks: u64,
    pub published: u64,
    /// Source could not be read
    pub skipped_unavailable: u64,
    /// Too many aggregations still running
    pub skipped_busy: u64,
    /// Sink channel full or closed
    pub dropped: u64,
}

pub struct Pipeline {
    source: Arc<dyn CounterSource>,
    aggregator: FlowAggregator,
    sinks: Vec<Arc<dyn MetricsSink>>,
    settings: PipelineSettings,
    state: watch::Sender<PipelineState>,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn CounterSource>,
        resolver: IdentityResolver,
        sinks: Vec<Arc<dyn MetricsSink>>,
        settings: PipelineSettings,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            source,
            aggregator: FlowAggregator::new(resolver),
            sinks,
            settings,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// One snapshot and aggregation, bypassing the sinks
    pub async fn poll_once(&self) -> Result<AggregatedInterval> {
        let snapshot = self.source.snapshot().await?;
        Ok(self.aggregator.aggregate(&snapshot).await)
    }

    /// Poll every `interval` until `cancel` fires.
    ///
    /// Only this loop publishes and moves the state; aggregation tasks just
    /// return their interval. Aggregations still running at cancellation are
    /// aborted, and results that land after it are discarded, so an interval
    /// whose lookups were cut short is never published.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) -> PipelineReport {
        let interval = if interval < MIN_INTERVAL {
            warn!(requested = ?interval, "Polling interval too small, using {:?}", MIN_INTERVAL);
            MIN_INTERVAL
        } else {
            interval
        };

        info!(
            source = self.source.name(),
            interval = ?interval,
            sinks = self.sinks.len(),
            "Pipeline started"
        );

        let (tx, mut rx) = mpsc::channel::<Arc<AggregatedInterval>>(self.settings.sink_buffer.max(1));
        let sinks = self.sinks.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(interval) = rx.recv().await {
                for sink in &sinks {
                    if let Err(e) = sink.ingest(&interval) {
                        warn!(sink = sink.name(), error = %e, "Sink rejected interval");
                    }
                }
            }
        });

        let mut report = PipelineReport::default();
        let mut polls: JoinSet<AggregatedInterval> = JoinSet::new();

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = polls.join_next(), if !polls.is_empty() => {
                    match joined {
                        Ok(_) if cancel.is_cancelled() => {
                            debug!("Discarding interval aggregated during shutdown");
                        }
                        Ok(aggregated) => {
                            self.state.send_replace(PipelineState::Publishing);
                            publish(&tx, aggregated, &mut report);
                        }
                        Err(e) => error!(error = %e, "Aggregation task failed"),
                    }
                    self.settle(&polls);
                    continue;
                }
                _ = ticker.tick() => {}
            }
            report.ticks += 1;

            if polls.len() >= self.settings.max_in_flight_polls {
                warn!(
                    in_flight = polls.len(),
                    "Previous aggregations still running, skipping interval"
                );
                report.skipped_busy += 1;
                self.notify_skipped("aggregation backlog");
                continue;
            }

            self.state.send_replace(PipelineState::Polling);
            let snapshot = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                snapshot = self.source.snapshot() => snapshot,
            };

            match snapshot {
                Ok(snapshot) => {
                    if !snapshot.missing_tables().is_empty() {
                        debug!(missing = ?snapshot.missing_tables(), "Partial snapshot");
                    }
                    let aggregator = self.aggregator.clone();
                    polls.spawn(async move { aggregator.aggregate(&snapshot).await });
                }
                Err(e) => {
                    warn!(error = %e, "Counter source unavailable, skipping interval");
                    report.skipped_unavailable += 1;
                    self.notify_skipped(&e.to_string());
                }
            }
            self.settle(&polls);
        }

        polls.abort_all();
        while polls.join_next().await.is_some() {}
        self.state.send_replace(PipelineState::Stopped);

        drop(tx);
        if let Err(e) = dispatcher.await {
            error!(error = %e, "Sink dispatcher failed");
        }

        info!(?report, "Pipeline stopped");
        report
    }

    /// Aggregating while any poll is outstanding, otherwise idle
    fn settle(&self, polls: &JoinSet<AggregatedInterval>) {
        let state = if polls.is_empty() {
            PipelineState::Idle
        } else {
            PipelineState::Aggregating
        };
        self.state.send_replace(state);
    }

    fn notify_skipped(&self, reason: &str) {
        for sink in &self.sinks {
            sink.on_poll_skipped(reason);
        }
    }
}

/// Hand an interval to the dispatcher without waiting for room
fn publish(
    tx: &mpsc::Sender<Arc<AggregatedInterval>>,
    interval: AggregatedInterval,
    report: &mut PipelineReport,
) {
    let flows = interval.flows.len();
    match tx.try_send(Arc::new(interval)) {
        Ok(()) => {
            debug!(flows, "Interval published");
            report.published += 1;
        }
        Err(TrySendError::Full(_)) => {
            warn!(flows, "Sink buffer full, dropping interval");
            report.dropped += 1;
        }
        Err(TrySendError::Closed(_)) => {
            warn!(flows, "Sink dispatcher closed, dropping interval");
            report.dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::ebpf::{RawCounterSnapshot, ReplayCounterSource};
    use crate::k8s::StaticDirectory;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const C: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);
    const D: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 4);

    #[derive(Default)]
    struct CollectingSink {
        intervals: Mutex<Vec<AggregatedInterval>>,
    }

    impl MetricsSink for CollectingSink {
        fn name(&self) -> &str {
            "collecting"
        }

        fn ingest(&self, interval: &AggregatedInterval) -> Result<()> {
            self.intervals.lock().unwrap().push(interval.clone());
            Ok(())
        }
    }

    fn resolver(directory: StaticDirectory) -> IdentityResolver {
        IdentityResolver::new(
            Arc::new(directory),
            ResolverConfig {
                query_timeout: Duration::from_secs(60),
                ..ResolverConfig::default()
            },
            CancellationToken::new(),
        )
    }

    fn snapshot() -> RawCounterSnapshot {
        RawCounterSnapshot::builder().packets(A, B, 1).build()
    }

    #[tokio::test]
    async fn test_full_channel_drops_interval() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut report = PipelineReport::default();
        let interval = FlowAggregator::new(resolver(StaticDirectory::new()))
            .aggregate(&snapshot())
            .await;

        publish(&tx, interval.clone(), &mut report);
        publish(&tx, interval, &mut report);

        assert_eq!(report.published, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(rx.recv().await.unwrap().flows.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_source_publishes_nothing() {
        let source = Arc::new(ReplayCounterSource::new());
        let pipeline = Pipeline::new(
            source.clone(),
            resolver(StaticDirectory::new()),
            Vec::new(),
            PipelineSettings::default(),
        );
        let cancel = CancellationToken::new();

        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                time::sleep(Duration::from_secs(25)).await;
                cancel.cancel();
            })
        };
        let report = pipeline.run(Duration::from_secs(10), cancel).await;
        stopper.await.unwrap();

        assert_eq!(report.ticks, 3);
        assert_eq!(report.skipped_unavailable, 3);
        assert_eq!(report.published, 0);
        assert_eq!(source.polls(), 3);
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_aggregation_is_not_published() {
        let directory = StaticDirectory::new()
            .with_pod(A, "shop", "web")
            .with_service(B, "shop", "api")
            .with_latency(Duration::from_secs(25));
        let source = Arc::new(ReplayCounterSource::with_snapshots([snapshot()]));
        let sink = Arc::new(CollectingSink::default());
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::new(
            source,
            IdentityResolver::new(
                Arc::new(directory),
                ResolverConfig {
                    query_timeout: Duration::from_secs(60),
                    ..ResolverConfig::default()
                },
                cancel.child_token(),
            ),
            vec![sink.clone()],
            PipelineSettings::default(),
        );

        let (report, ()) = tokio::join!(
            pipeline.run(Duration::from_secs(10), cancel.clone()),
            async {
                time::sleep(Duration::from_secs(5)).await;
                cancel.cancel();
            }
        );

        assert_eq!(report.ticks, 1);
        assert_eq!(report.published, 0);
        assert!(sink.intervals.lock().unwrap().is_empty());
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_stays_aggregating_while_a_poll_is_outstanding() {
        let directory = StaticDirectory::new()
            .with_pod(A, "shop", "a")
            .with_pod(B, "shop", "b")
            .with_pod(C, "shop", "c")
            .with_pod(D, "shop", "d")
            .with_latency(Duration::from_secs(15));
        let source = Arc::new(ReplayCounterSource::with_snapshots([
            snapshot(),
            RawCounterSnapshot::builder().packets(C, D, 1).build(),
        ]));
        let sink = Arc::new(CollectingSink::default());
        let pipeline = Pipeline::new(
            source,
            resolver(directory),
            vec![sink.clone()],
            PipelineSettings::default(),
        );
        let cancel = CancellationToken::new();

        // First poll finishes at 15s, the second is busy until 25s
        let (report, observed) = tokio::join!(
            pipeline.run(Duration::from_secs(10), cancel.clone()),
            async {
                time::sleep(Duration::from_secs(16)).await;
                let observed = pipeline.state();
                cancel.cancel();
                observed
            }
        );

        assert_eq!(observed, PipelineState::Aggregating);
        assert_eq!(report.published, 1);
        assert_eq!(sink.intervals.lock().unwrap().len(), 1);
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let pipeline = Pipeline::new(
            Arc::new(ReplayCounterSource::new()),
            resolver(StaticDirectory::new()),
            Vec::new(),
            PipelineSettings::default(),
        );
        let cancel = CancellationToken::new();

        let (report, ()) = tokio::join!(
            pipeline.run(Duration::ZERO, cancel.clone()),
            async {
                time::sleep(Duration::from_millis(5)).await;
                cancel.cancel();
            }
        );

        assert!(report.ticks >= 1);
        assert_eq!(report.ticks, report.skipped_unavailable);
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_poll_once_aggregates() {
        let source = Arc::new(ReplayCounterSource::with_snapshots([snapshot()]));
        let pipeline = Pipeline::new(
            source,
            resolver(StaticDirectory::new()),
            Vec::new(),
            PipelineSettings::default(),
        );

        let interval = pipeline.poll_once().await.unwrap();
        assert_eq!(interval.summary.total_packets, 1);
        assert!(pipeline.poll_once().await.is_err());
    }
}
