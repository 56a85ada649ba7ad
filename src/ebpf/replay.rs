use super::{CounterSource, RawCounterSnapshot};
use crate::{NetInsightError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Counter source that hands out queued outcomes in order.
///
/// Used to drive the pipeline without a kernel program attached. Once the
/// queue is drained every poll fails with `SourceUnavailable`.
pub struct ReplayCounterSource {
    queue: Mutex<VecDeque<Result<RawCounterSnapshot>>>,
    polls: AtomicU64,
}

impl ReplayCounterSource {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            polls: AtomicU64::new(0),
        }
    }

    pub fn with_snapshots(snapshots: impl IntoIterator<Item = RawCounterSnapshot>) -> Self {
        Self {
            queue: Mutex::new(snapshots.into_iter().map(Ok).collect()),
            polls: AtomicU64::new(0),
        }
    }

    pub async fn push_snapshot(&self, snapshot: RawCounterSnapshot) {
        self.queue.lock().await.push_back(Ok(snapshot));
    }

    pub async fn push_failure(&self, reason: &str) {
        self.queue
            .lock()
            .await
            .push_back(Err(NetInsightError::SourceUnavailable(reason.to_string())));
    }

    /// Number of times `snapshot` has been called
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }
}

impl Default for ReplayCounterSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterSource for ReplayCounterSource {
    async fn snapshot(&self) -> Result<RawCounterSnapshot> {
        let poll = self.polls.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(poll, "Replaying queued snapshot");

        self.queue.lock().await.pop_front().unwrap_or_else(|| {
            Err(NetInsightError::SourceUnavailable(
                "replay queue exhausted".to_string(),
            ))
        })
    }

    fn name(&self) -> &str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_replays_in_order_then_fails() {
        let source = ReplayCounterSource::new();
        source
            .push_snapshot(
                RawCounterSnapshot::builder()
                    .packets(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 1)
                    .build(),
            )
            .await;
        source.push_failure("not attached").await;

        assert!(source.snapshot().await.is_ok());
        assert!(matches!(
            source.snapshot().await,
            Err(NetInsightError::SourceUnavailable(reason)) if reason == "not attached"
        ));
        assert!(source.snapshot().await.is_err());
        assert_eq!(source.polls(), 3);
    }
}
