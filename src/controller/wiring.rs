//! Link & NIO Wiring Engine
//!
//! Turns a logical link between two ports into transport endpoints on the
//! computes hosting them:
//! - same compute: one `pair_local` call
//! - different computes: the two-phase pairing saga (see `saga`)
//!
//! Both ports' binding locks are held, in global port order, for the whole
//! operation. State is only committed once every remote step succeeded.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::saga::{pair_cross_host, SagaSide};
use super::{Controller, ProjectState};
use crate::compute::NodeHandle;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::notification::EventKind;
use crate::topology::{Link, LinkState, LinkUpdate, Nio, PortRef, Topology};

/// Result of re-establishing one link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkOutcome {
    #[serde(rename = "linkId")]
    pub link_id: Uuid,

    pub established: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Endpoints realized on the computes, not yet committed to state
struct Realized {
    sides: [SagaSide; 2],
    nios: [Nio; 2],
    cross_host: bool,
}

/// Bind both ports of `link`, or neither
fn bind_ports(topology: &mut Topology, link: &Link, nios: [Nio; 2]) -> OrchestratorResult<()> {
    for side in &link.sides {
        if topology.port(side)?.is_bound() {
            return Err(OrchestratorError::Conflict(format!(
                "port {} is already linked",
                side
            )));
        }
    }

    for (side, nio) in link.sides.iter().zip(nios) {
        let port = topology.port_mut(side)?;
        port.link_id = Some(link.link_id);
        port.nio = Some(nio);
    }
    Ok(())
}

impl Controller {
    pub async fn list_links(&self, project_id: Uuid) -> OrchestratorResult<Vec<Link>> {
        let state = self.project_state(project_id)?;
        let topology = state.topology.read().await;
        let mut links: Vec<Link> = topology.links.values().cloned().collect();
        links.sort_by_key(|l| l.created_at);
        Ok(links)
    }

    pub async fn get_link(&self, project_id: Uuid, link_id: Uuid) -> OrchestratorResult<Link> {
        let state = self.project_state(project_id)?;
        let topology = state.topology.read().await;
        topology.link(link_id).cloned()
    }

    /// Link two unbound ports
    ///
    /// On return either the link is `established` with both ports bound, or
    /// an error is returned and both ports are unbound.
    pub async fn create_link(&self, project_id: Uuid, a: PortRef, b: PortRef) -> OrchestratorResult<Link> {
        if a == b {
            return Err(OrchestratorError::InvalidInput(format!(
                "port {} cannot be linked to itself",
                a
            )));
        }
        let state = self.project_state(project_id)?;
        let this = self.clone();

        self.detached(async move {
            this.ensure_not_deleting(&[a, b])?;
            {
                let topology = state.topology.read().await;
                topology.port(&a)?;
                topology.port(&b)?;
            }
            let _ports = this.lock_ports(&[a, b]).await;
            let realized = this.realize(&state, a, b).await?;

            let mut link = Link::new(project_id, a, b);
            link.state = LinkState::Established;
            link.cross_host = realized.cross_host;

            let mut topology = state.topology.write().await;
            if let Err(e) = this.commit_binding(&mut topology, &link, realized.nios) {
                drop(topology);
                this.release_realized(&realized.sides).await;
                return Err(e);
            }
            topology.links.insert(link.link_id, link.clone());
            state.events.publish(EventKind::LinkCreated, &link);

            info!(
                "Link {} established ({})",
                link.link_id,
                if link.cross_host { "cross-host" } else { "local" }
            );
            Ok(link)
        })
        .await
    }

    /// Realize a `defined` link, e.g. after a project was loaded
    pub async fn establish_link(&self, project_id: Uuid, link_id: Uuid) -> OrchestratorResult<Link> {
        let state = self.project_state(project_id)?;
        let this = self.clone();

        self.detached(async move {
            let sides = state.topology.read().await.link(link_id)?.sides;
            this.ensure_not_deleting(&sides)?;
            let _ports = this.lock_ports(&sides).await;

            if state.topology.read().await.link(link_id)?.is_established() {
                return Err(OrchestratorError::Conflict(format!(
                    "link {} is already established",
                    link_id
                )));
            }

            let realized = this.realize(&state, sides[0], sides[1]).await?;

            let mut topology = state.topology.write().await;
            let mut link = match topology.link(link_id) {
                Ok(link) => link.clone(),
                Err(e) => {
                    drop(topology);
                    this.release_realized(&realized.sides).await;
                    return Err(e);
                }
            };
            link.state = LinkState::Established;
            link.cross_host = realized.cross_host;

            if let Err(e) = this.commit_binding(&mut topology, &link, realized.nios) {
                drop(topology);
                this.release_realized(&realized.sides).await;
                return Err(e);
            }
            topology.links.insert(link_id, link.clone());
            state.events.publish(EventKind::LinkUpdated, &link);
            Ok(link)
        })
        .await
    }

    /// Try to realize every `defined` link of a project
    pub async fn establish_links(&self, project_id: Uuid) -> OrchestratorResult<Vec<LinkOutcome>> {
        let defined: Vec<Uuid> = self
            .list_links(project_id)
            .await?
            .into_iter()
            .filter(|l| !l.is_established())
            .map(|l| l.link_id)
            .collect();

        let mut outcomes = Vec::with_capacity(defined.len());
        for link_id in defined {
            let outcome = match self.establish_link(project_id, link_id).await {
                Ok(_) => LinkOutcome {
                    link_id,
                    established: true,
                    error: None,
                },
                Err(e) => LinkOutcome {
                    link_id,
                    established: false,
                    error: Some(e.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Change link metadata
    pub async fn update_link(
        &self,
        project_id: Uuid,
        link_id: Uuid,
        update: LinkUpdate,
    ) -> OrchestratorResult<Link> {
        let state = self.project_state(project_id)?;
        let mut topology = state.topology.write().await;
        let link = topology
            .links
            .get_mut(&link_id)
            .ok_or_else(|| OrchestratorError::not_found("Link", link_id))?;
        if let Some(suspend) = update.suspend {
            link.suspend = suspend;
        }
        let link = link.clone();
        state.events.publish(EventKind::LinkUpdated, &link);
        Ok(link)
    }

    /// Delete a link; captures on either side are stopped first
    ///
    /// A second delete of the same link reports `NotFound`.
    pub async fn delete_link(&self, project_id: Uuid, link_id: Uuid) -> OrchestratorResult<()> {
        let state = self.project_state(project_id)?;
        let this = self.clone();
        self.detached(async move { this.teardown_link(&state, link_id).await })
            .await
    }

    /// Stop captures, release both endpoints, then drop the link
    ///
    /// Release is best-effort: an endpoint whose compute is unreachable, or
    /// that is already gone, counts as released.
    pub(crate) async fn teardown_link(&self, state: &ProjectState, link_id: Uuid) -> OrchestratorResult<()> {
        let sides = state.topology.read().await.link(link_id)?.sides;
        let _ports = self.lock_ports(&sides).await;
        let link = state.topology.read().await.link(link_id)?.clone();

        for side in &link.sides {
            self.force_stop_capture(state, side).await;
        }

        if link.is_established() {
            let targets: Vec<(String, NodeHandle, PortRef)> = {
                let topology = state.topology.read().await;
                link.sides
                    .iter()
                    .filter_map(|side| {
                        let node = topology.nodes.get(&side.node_id)?;
                        Some((node.compute_id.clone(), NodeHandle::from(node), *side))
                    })
                    .collect()
            };
            join_all(
                targets
                    .iter()
                    .map(|(compute_id, node, side)| self.release_side(compute_id, node, side)),
            )
            .await;
        }

        let mut topology = state.topology.write().await;
        if let Some(link) = topology.links.remove(&link_id) {
            for side in &link.sides {
                if let Ok(port) = topology.port_mut(side) {
                    if port.link_id == Some(link_id) {
                        port.unbind();
                    }
                }
            }
            state.events.publish(EventKind::LinkDeleted, &link);
            info!("Link {} deleted", link_id);
        }
        Ok(())
    }

    /// Bind both sides of `link` under the project write lock
    ///
    /// A node whose deletion started after the link was requested has
    /// already collected its links, so binding to it is refused.
    fn commit_binding(&self, topology: &mut Topology, link: &Link, nios: [Nio; 2]) -> OrchestratorResult<()> {
        self.ensure_not_deleting(&link.sides)?;
        bind_ports(topology, link, nios)
    }

    async fn release_side(&self, compute_id: &str, node: &NodeHandle, side: &PortRef) {
        let client = match self.registry.client(compute_id) {
            Ok(client) => client,
            Err(e) => {
                info!(
                    "Endpoint {} assumed gone with compute '{}': {}",
                    side, compute_id, e
                );
                return;
            }
        };

        if let Err(e) = self
            .remote_release(
                compute_id,
                "release endpoint",
                client.release_endpoint(node, side.address),
            )
            .await
        {
            warn!("Endpoint {} not released, assumed gone: {}", side, e);
        }
    }

    /// Resolve a port for wiring: node known, port unbound, compute connected
    fn wiring_side(&self, topology: &Topology, port: &PortRef) -> OrchestratorResult<SagaSide> {
        let node = topology.node(port.node_id)?;
        let bound = node
            .port(port.address)
            .ok_or_else(|| OrchestratorError::not_found("Port", port))?
            .is_bound();
        if bound {
            return Err(OrchestratorError::Conflict(format!(
                "port {} of '{}' is already linked",
                port.address, node.name
            )));
        }

        Ok(SagaSide {
            compute_id: node.compute_id.clone(),
            client: self.registry.client(&node.compute_id)?,
            node: NodeHandle::from(node),
            port: port.address,
        })
    }

    async fn realize(&self, state: &ProjectState, a: PortRef, b: PortRef) -> OrchestratorResult<Realized> {
        let (side_a, side_b) = {
            let topology = state.topology.read().await;
            (self.wiring_side(&topology, &a)?, self.wiring_side(&topology, &b)?)
        };

        if side_a.compute_id != side_b.compute_id {
            let (nio_a, nio_b) = pair_cross_host(self, &side_a, &side_b).await?;
            return Ok(Realized {
                sides: [side_a, side_b],
                nios: [nio_a, nio_b],
                cross_host: true,
            });
        }

        let paired = self
            .remote(
                &side_a.compute_id,
                "pair endpoints",
                side_a.client.pair_local(
                    (&side_a.node, side_a.port),
                    (&side_b.node, side_b.port),
                ),
            )
            .await;

        match paired {
            Ok((local_a, local_b)) => Ok(Realized {
                sides: [side_a, side_b],
                nios: [
                    Nio::Paired {
                        local: local_a.clone(),
                        remote: local_b.clone(),
                    },
                    Nio::Paired {
                        local: local_b,
                        remote: local_a,
                    },
                ],
                cross_host: false,
            }),
            Err(e) => {
                // A timed-out pairing may have been applied remotely
                if matches!(e, OrchestratorError::Timeout { .. }) {
                    self.release_realized(&[side_a, side_b]).await;
                }
                Err(e)
            }
        }
    }

    async fn release_realized(&self, sides: &[SagaSide]) {
        join_all(sides.iter().map(|side| async move {
            if let Err(e) = self
                .remote_release(
                    &side.compute_id,
                    "release endpoint",
                    side.client.release_endpoint(&side.node, side.port),
                )
                .await
            {
                debug!("Endpoint {} on node {} not released: {}", side.port, side.node.node_id, e);
            }
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::controller;
    use super::*;
    use crate::compute::{ComputeDescriptor, SimulatedConnector, SimulatedOp};
    use crate::error::ErrorKind;
    use crate::topology::{Node, NodeRequest, NodeType};

    async fn setup(computes: &[(&str, &str)]) -> (Controller, SimulatedConnector, Uuid) {
        let (controller, connector) = controller();
        for (id, address) in computes {
            controller
                .add_compute(ComputeDescriptor::new(*address, 8001).with_id(*id))
                .await
                .unwrap();
        }
        let project_id = controller.open_project("lab", None).unwrap().project_id;
        (controller, connector, project_id)
    }

    async fn node_on(controller: &Controller, project_id: Uuid, name: &str, compute: &str) -> Node {
        controller
            .create_node(project_id, NodeRequest::new(name, NodeType::Vpcs, compute))
            .await
            .unwrap()
    }

    fn port0(node: &Node) -> PortRef {
        PortRef::new(node.node_id, 0, 0)
    }

    #[tokio::test]
    async fn test_local_link_uses_one_pairing() {
        let (controller, connector, project_id) = setup(&[("h1", "10.0.0.1")]).await;
        let a = node_on(&controller, project_id, "pc1", "h1").await;
        let b = node_on(&controller, project_id, "pc2", "h1").await;

        let link = controller
            .create_link(project_id, port0(&a), port0(&b))
            .await
            .unwrap();
        assert_eq!(link.state, LinkState::Established);
        assert!(!link.cross_host);
        assert_eq!(
            connector
                .compute("h1")
                .calls()
                .iter()
                .filter(|op| **op == SimulatedOp::PairLocal)
                .count(),
            1
        );

        let a = controller.get_node(project_id, a.node_id).await.unwrap();
        assert_eq!(a.ports[0].link_id, Some(link.link_id));
    }

    #[tokio::test]
    async fn test_port_cannot_carry_two_links() {
        let (controller, _, project_id) = setup(&[("h1", "10.0.0.1")]).await;
        let a = node_on(&controller, project_id, "pc1", "h1").await;
        let b = node_on(&controller, project_id, "pc2", "h1").await;
        let c = node_on(&controller, project_id, "pc3", "h1").await;

        controller
            .create_link(project_id, port0(&a), port0(&b))
            .await
            .unwrap();
        let err = controller
            .create_link(project_id, port0(&a), port0(&c))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_self_link_rejected() {
        let (controller, _, project_id) = setup(&[("h1", "10.0.0.1")]).await;
        let a = node_on(&controller, project_id, "pc1", "h1").await;

        let err = controller
            .create_link(project_id, port0(&a), port0(&a))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_unknown_port_not_found() {
        let (controller, _, project_id) = setup(&[("h1", "10.0.0.1")]).await;
        let a = node_on(&controller, project_id, "pc1", "h1").await;
        let b = node_on(&controller, project_id, "pc2", "h1").await;

        let err = controller
            .create_link(project_id, port0(&a), PortRef::new(b.node_id, 5, 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_second_delete_reports_not_found() {
        let (controller, _, project_id) = setup(&[("h1", "10.0.0.1"), ("h2", "10.0.0.2")]).await;
        let a = node_on(&controller, project_id, "pc1", "h1").await;
        let b = node_on(&controller, project_id, "pc2", "h2").await;

        let link = controller
            .create_link(project_id, port0(&a), port0(&b))
            .await
            .unwrap();
        controller.delete_link(project_id, link.link_id).await.unwrap();

        let err = controller
            .delete_link(project_id, link.link_id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete_node_removes_its_links() {
        let (controller, connector, project_id) = setup(&[("h1", "10.0.0.1")]).await;
        let a = node_on(&controller, project_id, "pc1", "h1").await;
        let b = node_on(&controller, project_id, "pc2", "h1").await;
        controller
            .create_link(project_id, port0(&a), port0(&b))
            .await
            .unwrap();

        controller.delete_node(project_id, a.node_id).await.unwrap();

        assert!(controller.list_links(project_id).await.unwrap().is_empty());
        let b = controller.get_node(project_id, b.node_id).await.unwrap();
        assert!(!b.ports[0].is_bound());
        assert_eq!(connector.compute("h1").endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_link_between_ports_of_same_node() {
        let (controller, _, project_id) = setup(&[("h1", "10.0.0.1")]).await;
        let switch = controller
            .create_node(
                project_id,
                NodeRequest::new("sw1", NodeType::EthernetSwitch, "h1").with_ports(1, 4),
            )
            .await
            .unwrap();

        let link = controller
            .create_link(
                project_id,
                PortRef::new(switch.node_id, 0, 0),
                PortRef::new(switch.node_id, 0, 1),
            )
            .await
            .unwrap();
        assert!(link.is_established());
    }

    #[tokio::test]
    async fn test_establish_links_after_load() {
        let (controller, _, project_id) = setup(&[("h1", "10.0.0.1"), ("h2", "10.0.0.2")]).await;
        let a = node_on(&controller, project_id, "pc1", "h1").await;
        let b = node_on(&controller, project_id, "pc2", "h2").await;
        controller
            .create_link(project_id, port0(&a), port0(&b))
            .await
            .unwrap();

        let snapshot = controller.snapshot(project_id).await.unwrap();
        controller.close_project(project_id).await.unwrap();
        controller.load_project(snapshot).await.unwrap();

        let links = controller.list_links(project_id).await.unwrap();
        assert_eq!(links[0].state, LinkState::Defined);

        let outcomes = controller.establish_links(project_id).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].established, "{:?}", outcomes[0].error);

        let link = controller
            .get_link(project_id, links[0].link_id)
            .await
            .unwrap();
        assert!(link.is_established());
        assert!(link.cross_host);

        let err = controller
            .establish_link(project_id, link.link_id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_update_link_suspend_flag() {
        let (controller, _, project_id) = setup(&[("h1", "10.0.0.1")]).await;
        let a = node_on(&controller, project_id, "pc1", "h1").await;
        let b = node_on(&controller, project_id, "pc2", "h1").await;
        let link = controller
            .create_link(project_id, port0(&a), port0(&b))
            .await
            .unwrap();

        let updated = controller
            .update_link(
                project_id,
                link.link_id,
                LinkUpdate {
                    suspend: Some(true),
                },
            )
            .await
            .unwrap();
        assert!(updated.suspend);
        assert!(updated.is_established());
    }
}
