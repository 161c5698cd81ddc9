//! Node Lifecycle Manager
//!
//! One state machine per node:
//!
//! ```text
//! stopped --start--> starting --(ack)--> started
//! started --stop--> stopping --(ack)--> stopped
//! started --suspend--> suspended --resume--> started
//! started/stopped --reload--> same state
//! ```
//!
//! At most one operation is in flight per node. The remote call runs in a
//! detached task; on failure or timeout the node's previous status is
//! restored, so a transitional status never outlives its operation.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::capture::capture_payload;
use super::{Controller, ProjectState, DELETE_OPERATION};
use crate::compute::{NodeAction, NodeHandle};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::notification::EventKind;
use crate::topology::{Node, NodeRequest, NodeStatus, NodeType, NodeUpdate, PortRef};

/// What a lifecycle request turns into for a node in a given status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// Already in the requested state
    Noop,
    /// Forward to the backend, optionally exposing a transitional status
    Run {
        transitional: Option<NodeStatus>,
        target: NodeStatus,
    },
}

// ============ SBIO: Pure transition planning ============

fn plan(action: NodeAction, node_type: NodeType, status: NodeStatus, name: &str) -> OrchestratorResult<Transition> {
    use NodeStatus::*;

    let needs_suspend = matches!(action, NodeAction::Suspend | NodeAction::Resume);
    if needs_suspend && !node_type.capabilities().suspend {
        return Err(OrchestratorError::Unsupported(format!(
            "{} nodes cannot be suspended",
            node_type.api_segment()
        )));
    }

    let transition = match (action, status) {
        (_, Starting | Stopping) => {
            return Err(OrchestratorError::Conflict(format!(
                "node '{}' is {}",
                name, status
            )))
        }

        (NodeAction::Start, Stopped) => Transition::Run {
            transitional: Some(Starting),
            target: Started,
        },
        (NodeAction::Start, Started) => Transition::Noop,
        (NodeAction::Start, Suspended) => {
            return Err(OrchestratorError::Conflict(format!(
                "node '{}' is suspended; resume it instead",
                name
            )))
        }

        (NodeAction::Stop, Started | Suspended) => Transition::Run {
            transitional: Some(Stopping),
            target: Stopped,
        },
        (NodeAction::Stop, Stopped) => Transition::Noop,

        (NodeAction::Suspend, Started) => Transition::Run {
            transitional: None,
            target: Suspended,
        },
        (NodeAction::Suspend, Suspended) => Transition::Noop,
        (NodeAction::Resume, Suspended) => Transition::Run {
            transitional: None,
            target: Started,
        },
        (NodeAction::Resume, Started) => Transition::Noop,
        (NodeAction::Suspend | NodeAction::Resume, Stopped) => {
            return Err(OrchestratorError::VmNotRunning(name.to_string()))
        }

        (NodeAction::Reload, Started | Stopped) => Transition::Run {
            transitional: None,
            target: status,
        },
        (NodeAction::Reload, Suspended) => {
            return Err(OrchestratorError::Conflict(format!(
                "node '{}' cannot be reloaded while suspended",
                name
            )))
        }
    };
    Ok(transition)
}

fn operation_name(action: NodeAction) -> &'static str {
    match action {
        NodeAction::Start => "start node",
        NodeAction::Stop => "stop node",
        NodeAction::Suspend => "suspend node",
        NodeAction::Resume => "resume node",
        NodeAction::Reload => "reload node",
    }
}

// ============ SBIO: Lifecycle operations ============

impl Controller {
    pub async fn list_nodes(&self, project_id: Uuid) -> OrchestratorResult<Vec<Node>> {
        let state = self.project_state(project_id)?;
        let topology = state.topology.read().await;
        let mut nodes: Vec<Node> = topology.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    pub async fn get_node(&self, project_id: Uuid, node_id: Uuid) -> OrchestratorResult<Node> {
        let state = self.project_state(project_id)?;
        let topology = state.topology.read().await;
        topology.node(node_id).cloned()
    }

    /// Create a node on its compute and add it to the project
    pub async fn create_node(&self, project_id: Uuid, request: NodeRequest) -> OrchestratorResult<Node> {
        let state = self.project_state(project_id)?;

        if request.name.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "node name is empty".to_string(),
            ));
        }
        let geometry = request
            .ports
            .unwrap_or_else(|| request.node_type.default_geometry());
        request.node_type.port_layout().validate(geometry)?;

        let host = self.registry.get(&request.compute_id)?;
        if !host.supports(request.node_type) {
            return Err(OrchestratorError::Unsupported(format!(
                "compute '{}' cannot run {} nodes",
                host.compute_id,
                request.node_type.api_segment()
            )));
        }

        let node = Node::new(project_id, request, geometry);
        self.realize_node(state, node).await
    }

    /// Clone a node's configuration and ports into a new stopped node
    ///
    /// Links and transport endpoints are never copied.
    pub async fn duplicate_node(
        &self,
        project_id: Uuid,
        node_id: Uuid,
        name: Option<String>,
    ) -> OrchestratorResult<Node> {
        let state = self.project_state(project_id)?;
        let original = state.topology.read().await.node(node_id)?.clone();
        let name = name.unwrap_or_else(|| format!("{}-1", original.name));
        self.realize_node(state, original.duplicate(name)).await
    }

    async fn realize_node(&self, state: Arc<ProjectState>, node: Node) -> OrchestratorResult<Node> {
        let client = self.registry.client(&node.compute_id)?;
        let this = self.clone();

        self.detached(async move {
            let payload = node.node_type.create_payload(
                &node.name,
                &node.node_id.to_string(),
                node.geometry,
                &node.properties,
            );
            this.remote(
                &node.compute_id,
                "create node",
                client.create_node(&NodeHandle::from(&node), &payload),
            )
            .await?;

            let mut topology = state.topology.write().await;
            topology.nodes.insert(node.node_id, node.clone());
            state.events.publish(EventKind::NodeCreated, &node);
            info!(
                "Created {} node '{}' on compute '{}'",
                node.node_type.api_segment(),
                node.name,
                node.compute_id
            );
            Ok(node)
        })
        .await
    }

    /// Rename, move or reconfigure a node
    ///
    /// Properties are pushed to the backend before the change is committed.
    pub async fn update_node(
        &self,
        project_id: Uuid,
        node_id: Uuid,
        update: NodeUpdate,
    ) -> OrchestratorResult<Node> {
        let state = self.project_state(project_id)?;
        let guard = self.claim_node(node_id, "update")?;
        let this = self.clone();

        self.detached(async move {
            let _guard = guard;
            let node = state.topology.read().await.node(node_id)?.clone();

            if let Some(properties) = update.properties.as_ref().filter(|p| !p.is_empty()) {
                let client = this.registry.client(&node.compute_id)?;
                this.remote(
                    &node.compute_id,
                    "update node",
                    client.update_node(&NodeHandle::from(&node), properties),
                )
                .await?;
            }

            let mut topology = state.topology.write().await;
            let node = topology.node_mut(node_id)?;
            node.apply_update(update);
            let node = node.clone();
            state.events.publish(EventKind::NodeUpdated, &node);
            Ok(node)
        })
        .await
    }

    pub async fn start_node(&self, project_id: Uuid, node_id: Uuid) -> OrchestratorResult<Node> {
        self.transition(project_id, node_id, NodeAction::Start).await
    }

    /// Stop a node; its capture sessions are stopped first
    pub async fn stop_node(&self, project_id: Uuid, node_id: Uuid) -> OrchestratorResult<Node> {
        self.transition(project_id, node_id, NodeAction::Stop).await
    }

    pub async fn suspend_node(&self, project_id: Uuid, node_id: Uuid) -> OrchestratorResult<Node> {
        self.transition(project_id, node_id, NodeAction::Suspend).await
    }

    pub async fn resume_node(&self, project_id: Uuid, node_id: Uuid) -> OrchestratorResult<Node> {
        self.transition(project_id, node_id, NodeAction::Resume).await
    }

    pub async fn reload_node(&self, project_id: Uuid, node_id: Uuid) -> OrchestratorResult<Node> {
        self.transition(project_id, node_id, NodeAction::Reload).await
    }

    async fn transition(&self, project_id: Uuid, node_id: Uuid, action: NodeAction) -> OrchestratorResult<Node> {
        let state = self.project_state(project_id)?;
        let guard = self.claim_node(node_id, action.as_str())?;
        let this = self.clone();

        self.detached(async move {
            let _guard = guard;
            this.run_transition(&state, node_id, action).await
        })
        .await
    }

    async fn run_transition(
        &self,
        state: &ProjectState,
        node_id: Uuid,
        action: NodeAction,
    ) -> OrchestratorResult<Node> {
        let operation = operation_name(action);

        let (node, previous, target) = {
            let mut topology = state.topology.write().await;
            let node = topology.node_mut(node_id)?;
            let previous = node.status;

            let target = match plan(action, node.node_type, previous, &node.name)? {
                Transition::Noop => {
                    debug!("Node '{}' already {}", node.name, previous);
                    return Ok(node.clone());
                }
                Transition::Run {
                    transitional,
                    target,
                } => {
                    self.registry.client(&node.compute_id)?;
                    if let Some(transitional) = transitional {
                        node.status = transitional;
                    }
                    target
                }
            };
            (node.clone(), previous, target)
        };

        if action == NodeAction::Stop {
            self.stop_node_captures(state, &node).await;
        }

        let result = match self.registry.client(&node.compute_id) {
            Ok(client) => {
                self.remote(
                    &node.compute_id,
                    operation,
                    client.node_action(&NodeHandle::from(&node), action),
                )
                .await
            }
            Err(e) => Err(e),
        };

        let mut topology = state.topology.write().await;
        let committed = topology.node_mut(node_id)?;
        match result {
            Ok(()) => {
                committed.status = target;
                let committed = committed.clone();
                state.events.publish(EventKind::NodeUpdated, &committed);
                info!("Node '{}' {} -> {}", committed.name, previous, target);
                Ok(committed)
            }
            Err(e) => {
                committed.status = previous;
                warn!(
                    "Node '{}' failed to {}, back to {}: {}",
                    committed.name,
                    action.as_str(),
                    previous,
                    e
                );
                Err(e)
            }
        }
    }

    /// Delete a node: its links first, then the backend instance
    pub async fn delete_node(&self, project_id: Uuid, node_id: Uuid) -> OrchestratorResult<()> {
        let state = self.project_state(project_id)?;
        let guard = self.claim_node(node_id, DELETE_OPERATION)?;
        let this = self.clone();

        self.detached(async move {
            let _guard = guard;
            let node = state.topology.read().await.node(node_id)?.clone();
            if node.status.is_transitional() {
                return Err(OrchestratorError::Conflict(format!(
                    "node '{}' is {}",
                    node.name, node.status
                )));
            }
            let client = this.registry.client(&node.compute_id)?;

            let link_ids = state.topology.read().await.links_of(node_id);
            for link_id in link_ids {
                match this.teardown_link(&state, link_id).await {
                    Ok(()) | Err(OrchestratorError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }

            this.remote_release(
                &node.compute_id,
                "delete node",
                client.delete_node(&NodeHandle::from(&node)),
            )
            .await?;

            let mut topology = state.topology.write().await;
            if let Some(node) = topology.nodes.remove(&node_id) {
                state.events.publish(EventKind::NodeDeleted, &node);
                info!("Deleted node '{}'", node.name);
            }
            drop(topology);
            this.forget_port_locks(node_id);
            Ok(())
        })
        .await
    }

    /// Fold the backend's actual status into state
    ///
    /// Used after timeouts and when a compute reconnects; emits one
    /// `node.updated` only if the status drifted.
    pub async fn reconcile_node(&self, project_id: Uuid, node_id: Uuid) -> OrchestratorResult<Node> {
        let state = self.project_state(project_id)?;
        let guard = self.claim_node(node_id, "reconcile")?;
        let this = self.clone();

        self.detached(async move {
            let _guard = guard;
            let node = state.topology.read().await.node(node_id)?.clone();
            let client = this.registry.client(&node.compute_id)?;
            let actual = this
                .remote(
                    &node.compute_id,
                    "report node status",
                    client.node_status(&NodeHandle::from(&node)),
                )
                .await?;

            let mut topology = state.topology.write().await;
            let node = topology.node_mut(node_id)?;
            if node.status != actual {
                info!("Node '{}' drifted: {} -> {}", node.name, node.status, actual);
                node.status = actual;
                let mut stopped = Vec::new();
                if actual != NodeStatus::Started {
                    for port in &mut node.ports {
                        let Some(nio) = port.nio.take() else {
                            continue;
                        };
                        let (transport, capture) = nio.without_capture();
                        port.nio = Some(transport);
                        if let Some(capture) = capture {
                            let at = PortRef {
                                node_id,
                                address: port.address,
                            };
                            stopped.push(capture_payload(&at, port.link_id, &capture));
                        }
                    }
                }
                let node = node.clone();
                for payload in stopped {
                    state.events.publish(EventKind::CaptureStopped, payload);
                }
                state.events.publish(EventKind::NodeUpdated, &node);
                return Ok(node);
            }
            Ok(node.clone())
        })
        .await
    }

    /// Ask a router-emulator node for an idle-PC value
    pub async fn auto_idle_pc(&self, project_id: Uuid, node_id: Uuid) -> OrchestratorResult<String> {
        let state = self.project_state(project_id)?;
        let node = state.topology.read().await.node(node_id)?.clone();

        if !node.node_type.capabilities().idle_pc {
            return Err(OrchestratorError::Unsupported(format!(
                "idle-pc is not available for {} nodes",
                node.node_type.api_segment()
            )));
        }
        if node.status != NodeStatus::Started {
            return Err(OrchestratorError::VmNotRunning(node.name));
        }

        let client = self.registry.client(&node.compute_id)?;
        let this = self.clone();
        self.detached(async move {
            this.remote(
                &node.compute_id,
                "compute idle-pc",
                client.auto_idle_pc(&NodeHandle::from(&node)),
            )
            .await
        })
        .await
    }

    /// Drop nodes of an unregistered compute without contacting it
    pub(crate) async fn orphan_nodes(&self, state: &Arc<ProjectState>, node_ids: &[Uuid]) {
        let mut link_ids: Vec<Uuid> = {
            let topology = state.topology.read().await;
            node_ids
                .iter()
                .flat_map(|id| topology.links_of(*id))
                .collect()
        };
        link_ids.sort();
        link_ids.dedup();

        for link_id in link_ids {
            if let Err(e) = self.teardown_link(state, link_id).await {
                debug!("Orphaned link {} not torn down: {}", link_id, e);
            }
        }

        let mut topology = state.topology.write().await;
        for node_id in node_ids {
            if let Some(node) = topology.nodes.remove(node_id) {
                warn!("Orphaned node '{}' of compute '{}'", node.name, node.compute_id);
                state.events.publish(EventKind::NodeDeleted, &node);
            }
        }
        drop(topology);

        for node_id in node_ids {
            self.forget_port_locks(*node_id);
        }
    }
}
