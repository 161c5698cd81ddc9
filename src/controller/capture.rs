//! Packet capture on linked ports
//!
//! A capture wraps the port's transport NIO; stopping it restores the bare
//! transport. At most one capture runs per port, and only on a started node.

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Controller, ProjectState};
use crate::compute::NodeHandle;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::notification::EventKind;
use crate::topology::{CaptureSession, Node, NodeStatus, PortRef};

pub(super) fn capture_payload(port: &PortRef, link_id: Option<Uuid>, capture: &CaptureSession) -> serde_json::Value {
    json!({
        "nodeId": port.node_id,
        "adapter": port.address.adapter,
        "port": port.address.port,
        "linkId": link_id,
        "capture": capture,
    })
}

impl Controller {
    /// Start capturing on a bound port of a started node
    ///
    /// The sink defaults to `<node>_<adapter>-<port>.pcap` and the link type
    /// to the node family's default.
    pub async fn start_capture(
        &self,
        project_id: Uuid,
        port: PortRef,
        sink: Option<String>,
        link_type: Option<String>,
    ) -> OrchestratorResult<CaptureSession> {
        let state = self.project_state(project_id)?;
        let this = self.clone();

        self.detached(async move {
            state.topology.read().await.port(&port)?;
            let _port = this.lock_ports(&[port]).await;

            let (node, link_id, session) = {
                let topology = state.topology.read().await;
                let node = topology.node(port.node_id)?;
                let bound = topology.port(&port)?;

                if bound.capture().is_some() {
                    return Err(OrchestratorError::Conflict(format!(
                        "port {} of '{}' is already capturing",
                        port.address, node.name
                    )));
                }
                if node.status != NodeStatus::Started {
                    return Err(OrchestratorError::VmNotRunning(node.name.clone()));
                }
                if bound.nio.is_none() {
                    return Err(OrchestratorError::not_found("NIO", port));
                }

                let sink = sink.unwrap_or_else(|| {
                    format!("{}_{}-{}.pcap", node.name, port.address.adapter, port.address.port)
                });
                let link_type =
                    link_type.unwrap_or_else(|| node.node_type.default_link_type().to_string());
                (node.clone(), bound.link_id, CaptureSession::new(sink, link_type))
            };

            let client = this.registry.client(&node.compute_id)?;
            let handle = NodeHandle::from(&node);
            this.remote(
                &node.compute_id,
                "start capture",
                client.start_capture(&handle, port.address, &session),
            )
            .await?;

            let mut topology = state.topology.write().await;
            let still_running = topology
                .node(port.node_id)
                .map(|n| n.status == NodeStatus::Started)
                .unwrap_or(false);
            let committed = still_running
                && match topology.port_mut(&port) {
                    Ok(bound) => match bound.nio.take() {
                        Some(nio) => {
                            bound.nio = Some(nio.with_capture(session.clone()));
                            true
                        }
                        None => false,
                    },
                    Err(_) => false,
                };

            if !committed {
                drop(topology);
                if let Err(e) = this
                    .remote_release(
                        &node.compute_id,
                        "stop capture",
                        client.stop_capture(&handle, port.address),
                    )
                    .await
                {
                    warn!("Capture on {} left running remotely: {}", port, e);
                }
                return Err(OrchestratorError::VmNotRunning(node.name));
            }

            state.events.publish(
                EventKind::CaptureStarted,
                capture_payload(&port, link_id, &session),
            );
            info!("Capture started on '{}' {} -> {}", node.name, port.address, session.sink);
            Ok(session)
        })
        .await
    }

    /// Stop the capture on a port; a port without one is left untouched
    pub async fn stop_capture(&self, project_id: Uuid, port: PortRef) -> OrchestratorResult<()> {
        let state = self.project_state(project_id)?;
        let this = self.clone();

        self.detached(async move {
            state.topology.read().await.port(&port)?;
            let _port = this.lock_ports(&[port]).await;

            let node = {
                let topology = state.topology.read().await;
                if topology.port(&port)?.capture().is_none() {
                    return Ok(());
                }
                topology.node(port.node_id)?.clone()
            };

            let client = this.registry.client(&node.compute_id)?;
            this.remote_release(
                &node.compute_id,
                "stop capture",
                client.stop_capture(&NodeHandle::from(&node), port.address),
            )
            .await?;

            this.commit_capture_stop(&state, &port).await;
            Ok(())
        })
        .await
    }

    /// Capture on whichever side of the link has a started node
    pub async fn start_link_capture(
        &self,
        project_id: Uuid,
        link_id: Uuid,
        sink: Option<String>,
        link_type: Option<String>,
    ) -> OrchestratorResult<CaptureSession> {
        let side = {
            let state = self.project_state(project_id)?;
            let topology = state.topology.read().await;
            let link = topology.link(link_id)?;
            if !link.is_established() {
                return Err(OrchestratorError::Conflict(format!(
                    "link {} is not established",
                    link_id
                )));
            }
            link.sides
                .iter()
                .copied()
                .find(|side| {
                    topology
                        .node(side.node_id)
                        .map(|n| n.status == NodeStatus::Started)
                        .unwrap_or(false)
                })
                .ok_or_else(|| {
                    OrchestratorError::VmNotRunning(format!("both ends of link {}", link_id))
                })?
        };
        self.start_capture(project_id, side, sink, link_type).await
    }

    /// Stop whatever capture runs on either side of the link
    pub async fn stop_link_capture(&self, project_id: Uuid, link_id: Uuid) -> OrchestratorResult<()> {
        let sides = {
            let state = self.project_state(project_id)?;
            let topology = state.topology.read().await;
            topology.link(link_id)?.sides
        };
        for side in sides {
            self.stop_capture(project_id, side).await?;
        }
        Ok(())
    }

    /// Best-effort stop used by teardown paths; the port lock must be held
    pub(crate) async fn force_stop_capture(&self, state: &ProjectState, port: &PortRef) {
        let node = {
            let topology = state.topology.read().await;
            match topology.port(port) {
                Ok(bound) if bound.capture().is_some() => {}
                _ => return,
            }
            match topology.node(port.node_id) {
                Ok(node) => node.clone(),
                Err(_) => return,
            }
        };

        match self.registry.client(&node.compute_id) {
            Ok(client) => {
                if let Err(e) = self
                    .remote_release(
                        &node.compute_id,
                        "stop capture",
                        client.stop_capture(&NodeHandle::from(&node), port.address),
                    )
                    .await
                {
                    warn!("Capture on {} assumed stopped: {}", port, e);
                }
            }
            Err(e) => warn!("Capture on {} assumed stopped: {}", port, e),
        }

        self.commit_capture_stop(state, port).await;
    }

    /// Stop every capture of a node about to stop
    pub(crate) async fn stop_node_captures(&self, state: &ProjectState, node: &Node) {
        for address in node.captured_ports() {
            let port = PortRef {
                node_id: node.node_id,
                address,
            };
            let _port = self.lock_ports(&[port]).await;
            self.force_stop_capture(state, &port).await;
        }
    }

    async fn commit_capture_stop(&self, state: &ProjectState, port: &PortRef) {
        let mut topology = state.topology.write().await;
        let Ok(bound) = topology.port_mut(port) else {
            return;
        };
        let Some(nio) = bound.nio.take() else {
            return;
        };

        let (transport, capture) = nio.without_capture();
        bound.nio = Some(transport);
        let link_id = bound.link_id;

        if let Some(capture) = capture {
            state.events.publish(
                EventKind::CaptureStopped,
                capture_payload(port, link_id, &capture),
            );
            info!("Capture stopped on {}", port);
        }
    }
}
