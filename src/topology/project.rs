//! Project resource - the namespace holding nodes, links and drawings

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::link::{Link, LinkState};
use super::node::{Node, Port, PortRef};
use crate::error::OrchestratorError;

/// Project metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(rename = "projectId")]
    pub project_id: Uuid,

    pub name: String,

    #[serde(rename = "openedAt")]
    pub opened_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(project_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            project_id,
            name: name.into(),
            opened_at: Utc::now(),
        }
    }
}

/// Auxiliary drawing object (shapes, labels) shown on the topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drawing {
    #[serde(rename = "drawingId", default = "Uuid::new_v4")]
    pub drawing_id: Uuid,

    pub svg: String,

    #[serde(default)]
    pub x: i32,

    #[serde(default)]
    pub y: i32,

    #[serde(default)]
    pub z: i32,

    #[serde(default)]
    pub rotation: i32,
}

/// Editable drawing fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrawingUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub svg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<i32>,
}

impl Drawing {
    pub fn apply_update(&mut self, update: DrawingUpdate) {
        if let Some(svg) = update.svg {
            self.svg = svg;
        }
        if let Some(x) = update.x {
            self.x = x;
        }
        if let Some(y) = update.y {
            self.y = y;
        }
        if let Some(z) = update.z {
            self.z = z;
        }
        if let Some(rotation) = update.rotation {
            self.rotation = rotation;
        }
    }
}

/// Full state of a project at one point of its notification stream
///
/// Handed to late subscribers, and accepted by `load_project` to rehydrate
/// a project from external storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub project: Project,

    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub links: Vec<Link>,

    #[serde(default)]
    pub drawings: Vec<Drawing>,

    /// Last sequence number reflected in this snapshot
    #[serde(default)]
    pub sequence: u64,
}

/// Controller-side topology of one project
#[derive(Debug, Default)]
pub struct Topology {
    pub nodes: HashMap<Uuid, Node>,
    pub links: HashMap<Uuid, Link>,
    pub drawings: HashMap<Uuid, Drawing>,
}

impl Topology {
    pub fn node(&self, node_id: Uuid) -> Result<&Node, OrchestratorError> {
        self.nodes
            .get(&node_id)
            .ok_or_else(|| OrchestratorError::not_found("Node", node_id))
    }

    pub fn node_mut(&mut self, node_id: Uuid) -> Result<&mut Node, OrchestratorError> {
        self.nodes
            .get_mut(&node_id)
            .ok_or_else(|| OrchestratorError::not_found("Node", node_id))
    }

    pub fn link(&self, link_id: Uuid) -> Result<&Link, OrchestratorError> {
        self.links
            .get(&link_id)
            .ok_or_else(|| OrchestratorError::not_found("Link", link_id))
    }

    pub fn port(&self, port: &PortRef) -> Result<&Port, OrchestratorError> {
        self.node(port.node_id)?
            .port(port.address)
            .ok_or_else(|| OrchestratorError::not_found("Port", port))
    }

    pub fn port_mut(&mut self, port: &PortRef) -> Result<&mut Port, OrchestratorError> {
        self.node_mut(port.node_id)?
            .port_mut(port.address)
            .ok_or_else(|| OrchestratorError::not_found("Port", port))
    }

    /// Rebuild from a snapshot with every port unbound and every link defined
    pub fn rehydrate(snapshot: &ProjectSnapshot) -> Self {
        let mut topology = Topology::default();

        for node in &snapshot.nodes {
            let mut node = node.clone();
            node.project_id = snapshot.project.project_id;
            node.unbind_all();
            topology.nodes.insert(node.node_id, node);
        }

        for link in &snapshot.links {
            let mut link = link.clone();
            link.project_id = snapshot.project.project_id;
            link.state = LinkState::Defined;
            topology.links.insert(link.link_id, link);
        }

        for drawing in &snapshot.drawings {
            topology.drawings.insert(drawing.drawing_id, drawing.clone());
        }

        topology
    }

    pub fn snapshot(&self, project: &Project, sequence: u64) -> ProjectSnapshot {
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        let mut links: Vec<Link> = self.links.values().cloned().collect();
        links.sort_by_key(|l| l.created_at);
        let drawings = self.drawings.values().cloned().collect();

        ProjectSnapshot {
            project: project.clone(),
            nodes,
            links,
            drawings,
            sequence,
        }
    }

    /// Links with a side on the given node, established or not
    pub fn links_of(&self, node_id: Uuid) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .links
            .values()
            .filter(|l| l.sides.iter().any(|side| side.node_id == node_id))
            .map(|l| l.link_id)
            .collect();
        ids.sort();
        ids
    }

    /// Nodes hosted on the given compute
    pub fn nodes_on(&self, compute_id: &str) -> Vec<Uuid> {
        self.nodes
            .values()
            .filter(|n| n.compute_id == compute_id)
            .map(|n| n.node_id)
            .collect()
    }
}
