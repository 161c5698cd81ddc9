//! Topology model: projects, nodes, ports, links and transport endpoints

pub mod backend;
pub mod link;
pub mod nio;
pub mod node;
pub mod project;

pub use backend::{Capabilities, NodeType, PortGeometry, PortLayout};
pub use link::{Link, LinkState, LinkUpdate};
pub use nio::{CaptureSession, Nio, TunnelAddress};
pub use node::{Node, NodeRequest, NodeStatus, NodeUpdate, Port, PortAddress, PortRef};
pub use project::{Drawing, DrawingUpdate, Project, ProjectSnapshot, Topology};
