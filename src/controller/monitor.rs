//! Periodic compute health checks

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Controller;

/// Probe every registered compute each `interval` until `cancel` fires
///
/// Probes run concurrently; a host that stops answering is marked
/// disconnected, and one that comes back has its nodes reconciled.
pub fn spawn_health_monitor(
    controller: Controller,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ids = controller.registry().ids();
                    let results = join_all(ids.iter().map(|id| controller.probe_compute(id))).await;
                    for (id, result) in ids.iter().zip(results) {
                        if let Err(e) = result {
                            debug!("Health check of compute '{}' failed: {}", id, e);
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Health monitor stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::controller;
    use super::*;
    use crate::compute::ComputeDescriptor;

    #[tokio::test]
    async fn test_monitor_tracks_reachability() {
        let (controller, connector) = controller();
        controller
            .add_compute(ComputeDescriptor::new("10.0.0.1", 8001).with_id("h1"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn_health_monitor(controller.clone(), Duration::from_millis(20), cancel.clone());

        connector.compute("h1").set_reachable(false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!controller.get_compute("h1").unwrap().is_connected());

        connector.compute("h1").set_reachable(true);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(controller.get_compute("h1").unwrap().is_connected());

        cancel.cancel();
        handle.await.unwrap();
    }
}
