use std::{sync::Arc, time::Duration};

use {
    tokio::{task::JoinHandle, time::MissedTickBehavior},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use switchyard_protocol::Envelope;

use crate::state::GatewayState;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub evicted: usize,
}

/// Periodically pings every node and evicts the ones that stopped answering.
pub struct HeartbeatMonitor {
    state: Arc<GatewayState>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(state: Arc<GatewayState>, interval: Duration, timeout: Duration) -> Self {
        Self {
            state,
            interval,
            timeout,
        }
    }

    pub fn from_state(state: Arc<GatewayState>) -> Self {
        let interval = Duration::from_millis(state.config.ping_interval_ms);
        let timeout = Duration::from_millis(state.config.ping_timeout_ms);
        Self::new(state, interval, timeout)
    }

    /// One sweep: ping everyone, then evict nodes silent past the timeout.
    pub async fn tick(&self) -> HeartbeatReport {
        let pinged = self.state.nodes.read().await.broadcast_all(&Envelope::ping());
        let evicted = self.state.remove_stale_nodes(self.timeout).await;
        if evicted > 0 {
            info!(evicted, pinged, "heartbeat evicted stale nodes");
        } else {
            debug!(pinged, "heartbeat");
        }
        HeartbeatReport { pinged, evicted }
    }

    /// Run until `cancel` fires. The first sweep happens one interval after
    /// start.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.tick().await;
                    },
                }
            }
            debug!("heartbeat monitor stopped");
        })
    }
}
