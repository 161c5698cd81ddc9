//! Node resource - one device instance in a project
//!
//! A Node:
//! - Is owned by a project and realized on exactly one compute host
//! - Has a backend type selecting how the compute runs it
//! - Exposes an ordered list of ports, each bound to at most one link

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::backend::{NodeType, PortGeometry};
use super::nio::{CaptureSession, Nio};

/// Lifecycle status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
    Suspended,
}

impl NodeStatus {
    pub fn is_transitional(self) -> bool {
        matches!(self, NodeStatus::Starting | NodeStatus::Stopping)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Stopped => "stopped",
            NodeStatus::Starting => "starting",
            NodeStatus::Started => "started",
            NodeStatus::Stopping => "stopping",
            NodeStatus::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

/// (adapter, port) pair scoped to one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortAddress {
    pub adapter: u32,
    pub port: u32,
}

impl PortAddress {
    pub fn new(adapter: u32, port: u32) -> Self {
        Self { adapter, port }
    }
}

impl fmt::Display for PortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.adapter, self.port)
    }
}

/// Globally unique reference to a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    #[serde(rename = "nodeId")]
    pub node_id: Uuid,
    #[serde(flatten)]
    pub address: PortAddress,
}

impl PortRef {
    pub fn new(node_id: Uuid, adapter: u32, port: u32) -> Self {
        Self {
            node_id,
            address: PortAddress::new(adapter, port),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_id, self.address)
    }
}

/// A network interface slot on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,

    #[serde(flatten)]
    pub address: PortAddress,

    /// Link currently carried by this port
    #[serde(rename = "linkId", skip_serializing_if = "Option::is_none")]
    pub link_id: Option<Uuid>,

    /// Active transport endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nio: Option<Nio>,
}

impl Port {
    pub fn is_bound(&self) -> bool {
        self.link_id.is_some() || self.nio.is_some()
    }

    pub fn capture(&self) -> Option<&CaptureSession> {
        self.nio.as_ref().and_then(Nio::capture)
    }

    pub fn unbind(&mut self) {
        self.link_id = None;
        self.nio = None;
    }
}

/// Parameters for creating a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRequest {
    pub name: String,

    #[serde(rename = "nodeType")]
    pub node_type: NodeType,

    #[serde(rename = "computeId")]
    pub compute_id: String,

    /// Port geometry (backend default when omitted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortGeometry>,

    /// Backend-specific settings passed through to the compute
    #[serde(default)]
    pub properties: Map<String, Value>,

    #[serde(default)]
    pub x: i32,

    #[serde(default)]
    pub y: i32,
}

impl NodeRequest {
    pub fn new(name: impl Into<String>, node_type: NodeType, compute_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_type,
            compute_id: compute_id.into(),
            ports: None,
            properties: Map::new(),
            x: 0,
            y: 0,
        }
    }

    pub fn with_ports(mut self, adapters: u32, ports_per_adapter: u32) -> Self {
        self.ports = Some(PortGeometry::new(adapters, ports_per_adapter));
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Editable node fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

/// A device instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "nodeId")]
    pub node_id: Uuid,

    #[serde(rename = "projectId")]
    pub project_id: Uuid,

    #[serde(rename = "computeId")]
    pub compute_id: String,

    pub name: String,

    #[serde(rename = "nodeType")]
    pub node_type: NodeType,

    pub status: NodeStatus,

    pub geometry: PortGeometry,

    pub ports: Vec<Port>,

    #[serde(default)]
    pub properties: Map<String, Value>,

    #[serde(default)]
    pub x: i32,

    #[serde(default)]
    pub y: i32,
}

impl Node {
    /// Build a stopped node with all ports unbound
    pub fn new(project_id: Uuid, request: NodeRequest, geometry: PortGeometry) -> Self {
        let node_type = request.node_type;
        let ports = geometry
            .addresses()
            .map(|address| Port {
                name: node_type.port_name(address),
                address,
                link_id: None,
                nio: None,
            })
            .collect();

        Self {
            node_id: Uuid::new_v4(),
            project_id,
            compute_id: request.compute_id,
            name: request.name,
            node_type,
            status: NodeStatus::Stopped,
            geometry,
            ports,
            properties: request.properties,
            x: request.x,
            y: request.y,
        }
    }

    pub fn port(&self, address: PortAddress) -> Option<&Port> {
        self.ports.iter().find(|p| p.address == address)
    }

    pub fn port_mut(&mut self, address: PortAddress) -> Option<&mut Port> {
        self.ports.iter_mut().find(|p| p.address == address)
    }

    /// Ports currently carrying a capture session
    pub fn captured_ports(&self) -> Vec<PortAddress> {
        self.ports
            .iter()
            .filter(|p| p.capture().is_some())
            .map(|p| p.address)
            .collect()
    }

    /// Clear every port binding
    pub fn unbind_all(&mut self) {
        for port in &mut self.ports {
            port.unbind();
        }
    }

    /// Copy configuration and ports into a new stopped, unbound node
    pub fn duplicate(&self, name: impl Into<String>) -> Node {
        let mut copy = self.clone();
        copy.node_id = Uuid::new_v4();
        copy.name = name.into();
        copy.status = NodeStatus::Stopped;
        copy.x += 10;
        copy.y += 10;
        copy.unbind_all();
        copy
    }

    pub fn apply_update(&mut self, update: NodeUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(x) = update.x {
            self.x = x;
        }
        if let Some(y) = update.y {
            self.y = y;
        }
        if let Some(properties) = update.properties {
            self.properties.extend(properties);
        }
    }
}
