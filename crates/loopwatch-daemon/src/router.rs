//! Broadcast router: drains the change bus into the connection registry and
//! logs watch status for operators.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::bus::WatchNotification;
use crate::registry::ConnectionRegistry;

/// Route bus notifications until cancelled or the bus closes.
pub async fn run_router(
    mut bus_rx: broadcast::Receiver<WatchNotification>,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            notification = bus_rx.recv() => {
                match notification {
                    Ok(n) => route(&registry, n),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "router: lagged behind the change bus, events dropped");
                    }
                    Err(RecvError::Closed) => {
                        tracing::debug!("router: change bus closed");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("router: cancellation requested");
                break;
            }
        }
    }
}

/// Handle one notification. Change events re-read the registry every time.
pub fn route(registry: &ConnectionRegistry, notification: WatchNotification) {
    match notification {
        WatchNotification::Change(event) => {
            let delivery = registry.broadcast(&event);
            tracing::debug!(
                project_id = %event.project_id,
                file_type = %event.file_type,
                path = %event.path,
                kind = %event.kind,
                delivered = delivery.delivered,
                backpressured = delivery.backpressured,
                closed = delivery.closed,
                "router: change routed"
            );
        }
        WatchNotification::Ready { project_id } => {
            tracing::info!(project_id = %project_id, "watch ready");
        }
        WatchNotification::Error { project_id, message } => {
            tracing::warn!(project_id = %project_id, error = %message, "watch error");
        }
    }
}
