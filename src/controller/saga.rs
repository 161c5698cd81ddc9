//! Cross-host endpoint pairing
//!
//! Linking two ports on different computes takes four remote steps:
//!
//! 1. allocate endpoint A on host A
//! 2. allocate endpoint B on host B
//! 3. bind B, addressed at A
//! 4. bind A, addressed at B
//!
//! Each allocation registers its compensation (release that endpoint)
//! *before* the call, since a timed-out allocation may or may not have been
//! applied remotely. On any failure the recorded compensations run in
//! reverse order, so neither port is left bound.

use std::sync::Arc;

use tracing::{debug, warn};

use super::Controller;
use crate::compute::{ComputeApi, NodeHandle};
use crate::error::OrchestratorResult;
use crate::topology::{Nio, PortAddress, TunnelAddress};

/// One side of a link being realized
#[derive(Clone)]
pub(crate) struct SagaSide {
    pub compute_id: String,
    pub client: Arc<dyn ComputeApi>,
    pub node: NodeHandle,
    pub port: PortAddress,
}

/// Undo action for a completed (or possibly completed) step
enum Compensation {
    ReleaseEndpoint(SagaSide),
}

impl Compensation {
    async fn run(&self, controller: &Controller) {
        match self {
            Compensation::ReleaseEndpoint(side) => {
                let result = controller
                    .remote_release(
                        &side.compute_id,
                        "release endpoint",
                        side.client.release_endpoint(&side.node, side.port),
                    )
                    .await;
                match result {
                    Ok(()) => debug!(
                        "Compensated endpoint {} on node {}",
                        side.port, side.node.node_id
                    ),
                    Err(e) => warn!(
                        "Could not release endpoint {} on node {}: {}",
                        side.port, side.node.node_id, e
                    ),
                }
            }
        }
    }
}

/// Compensations recorded while a multi-step operation runs
pub(crate) struct Saga<'c> {
    controller: &'c Controller,
    compensations: Vec<Compensation>,
}

impl<'c> Saga<'c> {
    pub fn new(controller: &'c Controller) -> Self {
        Self {
            controller,
            compensations: Vec::new(),
        }
    }

    fn record(&mut self, compensation: Compensation) {
        self.compensations.push(compensation);
    }

    /// Undo every recorded step, newest first
    pub async fn compensate(self) {
        for compensation in self.compensations.iter().rev() {
            compensation.run(self.controller).await;
        }
    }

    /// Forget the compensations; the operation is complete
    pub fn complete(self) {}
}

async fn run_steps(
    controller: &Controller,
    saga: &mut Saga<'_>,
    a: &SagaSide,
    b: &SagaSide,
) -> OrchestratorResult<(TunnelAddress, TunnelAddress)> {
    saga.record(Compensation::ReleaseEndpoint(a.clone()));
    let addr_a = controller
        .remote(
            &a.compute_id,
            "allocate endpoint",
            a.client.allocate_endpoint(&a.node, a.port),
        )
        .await?;

    saga.record(Compensation::ReleaseEndpoint(b.clone()));
    let addr_b = controller
        .remote(
            &b.compute_id,
            "allocate endpoint",
            b.client.allocate_endpoint(&b.node, b.port),
        )
        .await?;

    controller
        .remote(
            &b.compute_id,
            "bind endpoint",
            b.client.bind_endpoint(&b.node, b.port, &addr_b, &addr_a),
        )
        .await?;

    controller
        .remote(
            &a.compute_id,
            "bind endpoint",
            a.client.bind_endpoint(&a.node, a.port, &addr_a, &addr_b),
        )
        .await?;

    Ok((addr_a, addr_b))
}

/// Realize a cross-host link; returns the endpoint of side A and side B
///
/// Either both endpoints are bound and mutually addressed, or neither is.
pub(crate) async fn pair_cross_host(
    controller: &Controller,
    a: &SagaSide,
    b: &SagaSide,
) -> OrchestratorResult<(Nio, Nio)> {
    let mut saga = Saga::new(controller);

    match run_steps(controller, &mut saga, a, b).await {
        Ok((addr_a, addr_b)) => {
            saga.complete();
            debug!("Tunnel {} <-> {} established", addr_a, addr_b);
            Ok((
                Nio::Tunnel {
                    local: addr_a.clone(),
                    remote: addr_b.clone(),
                },
                Nio::Tunnel {
                    local: addr_b,
                    remote: addr_a,
                },
            ))
        }
        Err(e) => {
            warn!("Cross-host pairing failed, rolling back: {}", e);
            saga.compensate().await;
            Err(e)
        }
    }
}
