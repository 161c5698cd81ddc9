//! Link resource - a logical connection between two ports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::PortRef;

/// Realization state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// Ports chosen, no transport yet
    Defined,
    /// Both endpoints active and, across hosts, mutually addressed
    Established,
}

/// A relation between exactly two ports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    #[serde(rename = "linkId")]
    pub link_id: Uuid,

    #[serde(rename = "projectId")]
    pub project_id: Uuid,

    pub sides: [PortRef; 2],

    pub state: LinkState,

    /// Whether the two sides live on different compute hosts
    #[serde(rename = "crossHost", default)]
    pub cross_host: bool,

    /// Traffic on the link is held by the client; carried as metadata only
    #[serde(default)]
    pub suspend: bool,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Editable link fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

impl Link {
    pub fn new(project_id: Uuid, a: PortRef, b: PortRef) -> Self {
        Self {
            link_id: Uuid::new_v4(),
            project_id,
            sides: [a, b],
            state: LinkState::Defined,
            cross_host: false,
            suspend: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == LinkState::Established
    }

    pub fn touches_node(&self, node_id: Uuid) -> bool {
        self.sides.iter().any(|s| s.node_id == node_id)
    }

    /// The side opposite to `port`, if `port` is one of this link's ends
    pub fn peer_of(&self, port: &PortRef) -> Option<&PortRef> {
        if &self.sides[0] == port {
            Some(&self.sides[1])
        } else if &self.sides[1] == port {
            Some(&self.sides[0])
        } else {
            None
        }
    }
}
