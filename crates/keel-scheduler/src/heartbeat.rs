//! Periodic heartbeat sender for a worker's own node.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{HeartbeatMetrics, NodeId, NodeRegistry};

/// Shortest period the loop will tick at.
const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Source of the metrics reported with each heartbeat.
pub type MetricsSource = Arc<dyn Fn() -> HeartbeatMetrics + Send + Sync>;

/// Sends heartbeats for one node until cancelled.
pub struct HeartbeatTask {
    registry: Arc<NodeRegistry>,
    node_id: NodeId,
    interval: Duration,
    metrics: MetricsSource,
}

impl HeartbeatTask {
    /// Creates a heartbeat task.
    pub fn new(
        registry: Arc<NodeRegistry>,
        node_id: NodeId,
        interval: Duration,
        metrics: MetricsSource,
    ) -> Self {
        Self {
            registry,
            node_id,
            interval,
            metrics,
        }
    }

    /// Sends one heartbeat.
    ///
    /// Failures are logged and swallowed; a missed heartbeat only ages the
    /// node towards unhealthy, which is the intended signal.
    pub async fn beat(&self) -> bool {
        let metrics = (self.metrics)();
        match self.registry.heartbeat(&self.node_id, &metrics).await {
            Ok(()) => true,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "heartbeat failed");
                false
            }
        }
    }

    /// Runs the heartbeat loop until the token is cancelled.
    ///
    /// Intervals below 100ms are raised to 100ms.
    pub async fn run(self, cancel: CancellationToken) {
        let period = self.interval.max(MIN_INTERVAL);
        info!(node_id = %self.node_id, interval = ?period, "heartbeat started");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if self.beat().await {
                        debug!(node_id = %self.node_id, "heartbeat sent");
                    }
                }
            }
        }

        info!(node_id = %self.node_id, "heartbeat stopped");
    }
}

impl std::fmt::Debug for HeartbeatTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatTask")
            .field("node_id", &self.node_id)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
