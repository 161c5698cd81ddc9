//! Project management: open/close, rehydration, drawings and subscriptions

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Controller, ProjectState};
use crate::compute::NodeHandle;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::notification::{EventKind, EventStream, Subscription};
use crate::topology::{Drawing, DrawingUpdate, NodeStatus, Project, ProjectSnapshot, Topology};

impl Controller {
    /// Open a project, creating it on first open
    ///
    /// Opening an already open project returns it unchanged.
    pub fn open_project(&self, name: impl Into<String>, project_id: Option<Uuid>) -> OrchestratorResult<Project> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "project name is empty".to_string(),
            ));
        }

        let project = match project_id {
            Some(id) => Project::with_id(id, name),
            None => Project::new(name),
        };

        let state = self
            .projects
            .entry(project.project_id)
            .or_insert_with(|| {
                info!("Opened project '{}' ({})", project.name, project.project_id);
                self.events.publish(EventKind::ProjectOpened, &project);
                Arc::new(self.new_project_state(project.clone(), Topology::default()))
            })
            .clone();

        Ok(state.project.clone())
    }

    fn new_project_state(&self, project: Project, topology: Topology) -> ProjectState {
        let events = EventStream::new(Some(project.project_id), self.config.notification_capacity);
        ProjectState {
            project,
            topology: RwLock::new(topology),
            events,
        }
    }

    /// Open a project from an external snapshot
    ///
    /// Every port comes back unbound, every link `defined` and every node
    /// `stopped`; nodes are recreated on their computes best-effort, and
    /// links are realized later with [`Controller::establish_link`].
    pub async fn load_project(&self, snapshot: ProjectSnapshot) -> OrchestratorResult<ProjectSnapshot> {
        let project_id = snapshot.project.project_id;
        if self.projects.contains_key(&project_id) {
            return Err(OrchestratorError::Conflict(format!(
                "project {} is already open",
                project_id
            )));
        }

        for node in &snapshot.nodes {
            self.registry.get(&node.compute_id)?;
        }
        for link in &snapshot.links {
            for side in &link.sides {
                let known = snapshot
                    .nodes
                    .iter()
                    .find(|n| n.node_id == side.node_id)
                    .and_then(|n| n.port(side.address));
                if known.is_none() {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "link {} references unknown port {}",
                        link.link_id, side
                    )));
                }
            }
        }

        let mut topology = Topology::rehydrate(&snapshot);
        for node in topology.nodes.values_mut() {
            node.status = NodeStatus::Stopped;
        }

        for node in topology.nodes.values() {
            let Ok(client) = self.registry.client(&node.compute_id) else {
                warn!(
                    "Compute '{}' unavailable, node '{}' not recreated",
                    node.compute_id, node.name
                );
                continue;
            };
            let payload = node.node_type.create_payload(
                &node.name,
                &node.node_id.to_string(),
                node.geometry,
                &node.properties,
            );
            let handle = NodeHandle::from(node);
            if let Err(e) = self
                .remote(&node.compute_id, "create node", client.create_node(&handle, &payload))
                .await
            {
                warn!("Node '{}' not recreated: {}", node.name, e);
            }
        }

        let project = Project::with_id(project_id, snapshot.project.name.clone());
        let state = Arc::new(self.new_project_state(project.clone(), topology));

        match self.projects.entry(project_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(OrchestratorError::Conflict(format!(
                    "project {} is already open",
                    project_id
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&state));
            }
        }

        info!(
            "Loaded project '{}' with {} node(s) and {} link(s)",
            project.name,
            snapshot.nodes.len(),
            snapshot.links.len()
        );
        self.events.publish(EventKind::ProjectOpened, &project);

        let topology = state.topology.read().await;
        Ok(topology.snapshot(&state.project, state.events.sequence()))
    }

    pub fn list_projects(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self
            .projects
            .iter()
            .map(|p| p.project.clone())
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        projects
    }

    pub fn get_project(&self, project_id: Uuid) -> OrchestratorResult<Project> {
        Ok(self.project_state(project_id)?.project.clone())
    }

    /// Close a project: evict subscribers and drop its in-memory state
    ///
    /// Computes hosting its nodes are told to release the project's
    /// resources, best-effort.
    pub async fn close_project(&self, project_id: Uuid) -> OrchestratorResult<()> {
        let (_, state) = self
            .projects
            .remove(&project_id)
            .ok_or_else(|| OrchestratorError::not_found("Project", project_id))?;

        let (computes, node_ids): (HashSet<String>, Vec<Uuid>) = {
            let topology = state.topology.write().await;
            state.events.close(EventKind::ProjectClosed, &state.project);
            (
                topology
                    .nodes
                    .values()
                    .map(|n| n.compute_id.clone())
                    .collect(),
                topology.nodes.keys().copied().collect(),
            )
        };
        for node_id in node_ids {
            self.forget_port_locks(node_id);
        }

        for compute_id in computes {
            let Ok(client) = self.registry.client(&compute_id) else {
                continue;
            };
            if let Err(e) = self
                .remote_release(&compute_id, "close project", client.close_project(project_id))
                .await
            {
                warn!("Compute '{}' did not close project: {}", compute_id, e);
            }
        }

        self.events.publish(EventKind::ProjectClosed, &state.project);
        info!("Closed project '{}'", state.project.name);
        Ok(())
    }

    /// Delete every node of a project on its compute, then close it
    pub async fn delete_project(&self, project_id: Uuid) -> OrchestratorResult<()> {
        let state = self.project_state(project_id)?;
        let nodes: Vec<_> = state
            .topology
            .read()
            .await
            .nodes
            .values()
            .map(|n| (n.compute_id.clone(), NodeHandle::from(n)))
            .collect();

        for (compute_id, handle) in nodes {
            let Ok(client) = self.registry.client(&compute_id) else {
                continue;
            };
            if let Err(e) = self
                .remote_release(&compute_id, "delete node", client.delete_node(&handle))
                .await
            {
                warn!("Node {} left on compute '{}': {}", handle.node_id, compute_id, e);
            }
        }

        self.close_project(project_id).await
    }

    /// Consistent view of a project and the sequence number it reflects
    pub async fn snapshot(&self, project_id: Uuid) -> OrchestratorResult<ProjectSnapshot> {
        let state = self.project_state(project_id)?;
        let topology = state.topology.read().await;
        Ok(topology.snapshot(&state.project, state.events.sequence()))
    }

    /// Subscribe to a project's stream
    ///
    /// The snapshot and the subscription are taken under the same read lock,
    /// so the first event delivered is the first one after the snapshot.
    pub async fn subscribe(
        &self,
        project_id: Uuid,
        resume_from: Option<u64>,
    ) -> OrchestratorResult<(ProjectSnapshot, Subscription)> {
        let state = self.project_state(project_id)?;
        let topology = state.topology.read().await;
        let subscription = state
            .events
            .subscribe(resume_from)
            .ok_or_else(|| OrchestratorError::not_found("Project", project_id))?;
        let snapshot = topology.snapshot(&state.project, subscription.last_sequence());
        Ok((snapshot, subscription))
    }

    // =========================================================================
    // Drawings
    // =========================================================================

    pub async fn list_drawings(&self, project_id: Uuid) -> OrchestratorResult<Vec<Drawing>> {
        let state = self.project_state(project_id)?;
        let topology = state.topology.read().await;
        let mut drawings: Vec<Drawing> = topology.drawings.values().cloned().collect();
        drawings.sort_by_key(|d| d.z);
        Ok(drawings)
    }

    pub async fn create_drawing(&self, project_id: Uuid, drawing: Drawing) -> OrchestratorResult<Drawing> {
        let state = self.project_state(project_id)?;
        let mut topology = state.topology.write().await;
        if topology.drawings.contains_key(&drawing.drawing_id) {
            return Err(OrchestratorError::Conflict(format!(
                "drawing {} already exists",
                drawing.drawing_id
            )));
        }
        topology.drawings.insert(drawing.drawing_id, drawing.clone());
        state.events.publish(EventKind::DrawingCreated, &drawing);
        Ok(drawing)
    }

    pub async fn update_drawing(
        &self,
        project_id: Uuid,
        drawing_id: Uuid,
        update: DrawingUpdate,
    ) -> OrchestratorResult<Drawing> {
        let state = self.project_state(project_id)?;
        let mut topology = state.topology.write().await;
        let drawing = topology
            .drawings
            .get_mut(&drawing_id)
            .ok_or_else(|| OrchestratorError::not_found("Drawing", drawing_id))?;
        drawing.apply_update(update);
        let drawing = drawing.clone();
        state.events.publish(EventKind::DrawingUpdated, &drawing);
        Ok(drawing)
    }

    pub async fn delete_drawing(&self, project_id: Uuid, drawing_id: Uuid) -> OrchestratorResult<()> {
        let state = self.project_state(project_id)?;
        let mut topology = state.topology.write().await;
        let drawing = topology
            .drawings
            .remove(&drawing_id)
            .ok_or_else(|| OrchestratorError::not_found("Drawing", drawing_id))?;
        state.events.publish(EventKind::DrawingDeleted, &drawing);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::controller;
    use super::*;
    use crate::compute::ComputeDescriptor;
    use crate::error::ErrorKind;
    use crate::notification::StreamItem;
    use crate::topology::{Link, LinkState, Node, NodeRequest, NodeType, PortGeometry, PortRef};

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (controller, _) = controller();
        let id = Uuid::new_v4();

        let first = controller.open_project("lab", Some(id)).unwrap();
        let again = controller.open_project("renamed", Some(id)).unwrap();

        assert_eq!(first, again);
        assert_eq!(controller.list_projects().len(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let (controller, _) = controller();
        let project = controller.open_project("lab", None).unwrap();
        let (snapshot, mut sub) = controller
            .subscribe(project.project_id, None)
            .await
            .unwrap();
        assert_eq!(snapshot.sequence, 0);

        controller.close_project(project.project_id).await.unwrap();

        match sub.next().await {
            Some(StreamItem::Event(e)) => assert_eq!(e.kind, EventKind::ProjectClosed),
            other => panic!("expected project.closed, got {:?}", other),
        }
        assert!(sub.next().await.is_none());
        assert_eq!(
            controller.get_project(project.project_id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_drawings_emit_events() {
        let (controller, _) = controller();
        let project = controller.open_project("lab", None).unwrap();
        let (_, mut sub) = controller
            .subscribe(project.project_id, None)
            .await
            .unwrap();

        let drawing = controller
            .create_drawing(
                project.project_id,
                Drawing {
                    drawing_id: Uuid::new_v4(),
                    svg: "<svg/>".to_string(),
                    x: 0,
                    y: 0,
                    z: 0,
                    rotation: 0,
                },
            )
            .await
            .unwrap();
        controller
            .update_drawing(
                project.project_id,
                drawing.drawing_id,
                DrawingUpdate {
                    x: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        controller
            .delete_drawing(project.project_id, drawing.drawing_id)
            .await
            .unwrap();

        let mut kinds = Vec::new();
        for _ in 0..3 {
            if let Some(StreamItem::Event(e)) = sub.next().await {
                kinds.push(e.kind);
            }
        }
        assert_eq!(
            kinds,
            vec![
                EventKind::DrawingCreated,
                EventKind::DrawingUpdated,
                EventKind::DrawingDeleted
            ]
        );
    }

    #[tokio::test]
    async fn test_load_project_rehydrates_unbound() {
        let (controller, connector) = controller();
        controller
            .add_compute(ComputeDescriptor::new("10.0.0.1", 8001).with_id("h1"))
            .await
            .unwrap();

        let project = Project::new("restored");
        let mut a = Node::new(
            project.project_id,
            NodeRequest::new("pc1", NodeType::Vpcs, "h1"),
            PortGeometry::new(1, 1),
        );
        a.status = NodeStatus::Started;
        let b = Node::new(
            project.project_id,
            NodeRequest::new("pc2", NodeType::Vpcs, "h1"),
            PortGeometry::new(1, 1),
        );
        let mut link = Link::new(
            project.project_id,
            PortRef::new(a.node_id, 0, 0),
            PortRef::new(b.node_id, 0, 0),
        );
        link.state = LinkState::Established;

        let loaded = controller
            .load_project(ProjectSnapshot {
                project: project.clone(),
                nodes: vec![a.clone(), b],
                links: vec![link],
                drawings: vec![],
                sequence: 99,
            })
            .await
            .unwrap();

        assert_eq!(loaded.sequence, 0);
        assert!(loaded.nodes.iter().all(|n| n.status == NodeStatus::Stopped));
        assert!(loaded.links.iter().all(|l| l.state == LinkState::Defined));
        assert!(connector.compute("h1").has_node(a.node_id));

        let again = controller
            .load_project(ProjectSnapshot {
                project,
                nodes: vec![],
                links: vec![],
                drawings: vec![],
                sequence: 0,
            })
            .await;
        assert_eq!(again.unwrap_err().kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_load_project_requires_known_compute() {
        let (controller, _) = controller();
        let project = Project::new("restored");
        let node = Node::new(
            project.project_id,
            NodeRequest::new("pc1", NodeType::Vpcs, "ghost"),
            PortGeometry::new(1, 1),
        );

        let err = controller
            .load_project(ProjectSnapshot {
                project,
                nodes: vec![node],
                links: vec![],
                drawings: vec![],
                sequence: 0,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
