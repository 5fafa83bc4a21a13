//! Heartbeat monitor: probes every connection on a fixed interval and
//! terminates the ones that stop answering.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::registry::ConnectionRegistry;

pub async fn run_heartbeat(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outcome = registry.sweep(Instant::now(), timeout);
                for id in &outcome.terminated {
                    tracing::info!(conn_id = %id, "heartbeat: connection unresponsive, terminated");
                }
                tracing::trace!(probed = outcome.probed, terminated = outcome.terminated.len(), "heartbeat: tick");
            }
            _ = cancel.cancelled() => {
                tracing::debug!("heartbeat: cancellation requested");
                break;
            }
        }
    }
}
