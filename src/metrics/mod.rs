pub mod aggregator;
pub mod exporter;
pub mod record;
pub mod server;

pub use aggregator::FlowAggregator;
pub use exporter::PrometheusSink;
pub use record::{
    AggregatedInterval, ConnectionRecord, ConnectionState, DropBreakdown, DropReason, FlowRecord,
    IntervalSummary, ProtocolBreakdown,
};
pub use server::MetricsServer;

use crate::Result;

/// Consumer of aggregated intervals.
///
/// Called from the pipeline's dispatcher task, one interval at a time and in
/// publication order.
pub trait MetricsSink: Send + Sync {
    fn name(&self) -> &str;

    fn ingest(&self, interval: &AggregatedInterval) -> Result<()>;

    /// A poll produced nothing to publish
    fn on_poll_skipped(&self, _reason: &str) {}
}
