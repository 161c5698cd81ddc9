//! Backend types - the device families a node can be realized with
//!
//! Each node carries a [`NodeType`] tag. The tag selects the remote API the
//! compute host exposes for that family, the capabilities it offers
//! (suspend, idle-PC, capture) and the shape of its port space. Adding a new
//! device family means adding a variant here, not touching the controller.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::node::PortAddress;
use crate::error::OrchestratorError;

/// Device family of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Router emulator
    Dynamips,
    /// Generic VM via hypervisor A
    Qemu,
    /// Generic VM via hypervisor B
    Virtualbox,
    /// Generic VM via hypervisor C
    Vmware,
    /// Container engine
    Docker,
    /// Simple packet-generating VM
    Vpcs,
    EthernetSwitch,
    EthernetHub,
    FrameRelaySwitch,
    AtmSwitch,
}

/// Optional operations a backend family supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub suspend: bool,
    pub idle_pc: bool,
    pub capture: bool,
}

/// Shape of a node's port space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortLayout {
    /// Adapter index varies, port index is always 0
    AdapterOnly { max_adapters: u32 },
    /// A single adapter 0 whose port index varies
    PortOnly { max_ports: u32 },
    /// Slot/port pairs, both vary
    SlotPort { max_slots: u32, max_ports_per_slot: u32 },
}

/// Requested number of adapters and ports per adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortGeometry {
    pub adapters: u32,
    #[serde(rename = "portsPerAdapter", default = "default_ports_per_adapter")]
    pub ports_per_adapter: u32,
}

fn default_ports_per_adapter() -> u32 {
    1
}

impl PortGeometry {
    pub fn new(adapters: u32, ports_per_adapter: u32) -> Self {
        Self {
            adapters,
            ports_per_adapter,
        }
    }

    /// Every port address in adapter-major order
    pub fn addresses(&self) -> impl Iterator<Item = PortAddress> + '_ {
        (0..self.adapters).flat_map(move |adapter| {
            (0..self.ports_per_adapter).map(move |port| PortAddress::new(adapter, port))
        })
    }
}

impl NodeType {
    pub const ALL: [NodeType; 10] = [
        NodeType::Dynamips,
        NodeType::Qemu,
        NodeType::Virtualbox,
        NodeType::Vmware,
        NodeType::Docker,
        NodeType::Vpcs,
        NodeType::EthernetSwitch,
        NodeType::EthernetHub,
        NodeType::FrameRelaySwitch,
        NodeType::AtmSwitch,
    ];

    /// Path segment of the compute API serving this family
    pub fn api_segment(self) -> &'static str {
        match self {
            NodeType::Dynamips => "dynamips",
            NodeType::Qemu => "qemu",
            NodeType::Virtualbox => "virtualbox",
            NodeType::Vmware => "vmware",
            NodeType::Docker => "docker",
            NodeType::Vpcs => "vpcs",
            NodeType::EthernetSwitch => "ethernet_switch",
            NodeType::EthernetHub => "ethernet_hub",
            NodeType::FrameRelaySwitch => "frame_relay_switch",
            NodeType::AtmSwitch => "atm_switch",
        }
    }

    pub fn capabilities(self) -> Capabilities {
        let suspend = matches!(
            self,
            NodeType::Dynamips
                | NodeType::Qemu
                | NodeType::Virtualbox
                | NodeType::Vmware
                | NodeType::Docker
        );
        Capabilities {
            suspend,
            idle_pc: self == NodeType::Dynamips,
            capture: true,
        }
    }

    pub fn port_layout(self) -> PortLayout {
        match self {
            NodeType::Dynamips => PortLayout::SlotPort {
                max_slots: 7,
                max_ports_per_slot: 16,
            },
            NodeType::Qemu => PortLayout::AdapterOnly { max_adapters: 275 },
            NodeType::Virtualbox => PortLayout::AdapterOnly { max_adapters: 36 },
            NodeType::Vmware => PortLayout::AdapterOnly { max_adapters: 10 },
            NodeType::Docker => PortLayout::AdapterOnly { max_adapters: 99 },
            NodeType::Vpcs => PortLayout::AdapterOnly { max_adapters: 1 },
            NodeType::EthernetSwitch | NodeType::EthernetHub => {
                PortLayout::PortOnly { max_ports: 256 }
            }
            NodeType::FrameRelaySwitch | NodeType::AtmSwitch => {
                PortLayout::PortOnly { max_ports: 64 }
            }
        }
    }

    /// Geometry used when a create request does not specify one
    pub fn default_geometry(self) -> PortGeometry {
        match self.port_layout() {
            PortLayout::AdapterOnly { max_adapters } => PortGeometry::new(max_adapters.min(4), 1),
            PortLayout::PortOnly { .. } => PortGeometry::new(1, 8),
            PortLayout::SlotPort { .. } => PortGeometry::new(1, 2),
        }
    }

    /// Link-layer type used for captures when the caller gives no hint
    pub fn default_link_type(self) -> &'static str {
        match self {
            NodeType::FrameRelaySwitch => "DLT_FRELAY",
            NodeType::AtmSwitch => "DLT_ATM_RFC1483",
            _ => "DLT_EN10MB",
        }
    }

    /// Human-readable name of a port
    pub fn port_name(self, address: PortAddress) -> String {
        match self {
            NodeType::Dynamips => format!("FastEthernet{}/{}", address.adapter, address.port),
            NodeType::Vpcs | NodeType::Docker => format!("eth{}", address.adapter),
            NodeType::Qemu | NodeType::Virtualbox | NodeType::Vmware => {
                format!("Ethernet{}", address.adapter)
            }
            NodeType::EthernetSwitch | NodeType::EthernetHub => {
                format!("Ethernet{}", address.port)
            }
            NodeType::FrameRelaySwitch | NodeType::AtmSwitch => format!("{}", address.port),
        }
    }

    /// Body of the remote create call for this family
    ///
    /// Caller-supplied properties are kept; the port geometry is expressed the
    /// way each family's API expects it.
    pub fn create_payload(
        self,
        name: &str,
        node_id: &str,
        geometry: PortGeometry,
        properties: &Map<String, Value>,
    ) -> Value {
        let mut body = properties.clone();
        body.insert("name".to_string(), json!(name));
        body.insert("node_id".to_string(), json!(node_id));

        match self.port_layout() {
            PortLayout::AdapterOnly { .. } => {
                if self != NodeType::Vpcs {
                    body.insert("adapters".to_string(), json!(geometry.adapters));
                }
            }
            PortLayout::PortOnly { .. } => {
                let mapping: Vec<Value> = (0..geometry.ports_per_adapter)
                    .map(|port| match self {
                        NodeType::EthernetSwitch => json!({
                            "name": self.port_name(PortAddress::new(0, port)),
                            "port_number": port,
                            "type": "access",
                            "vlan": 1,
                        }),
                        _ => json!({
                            "name": self.port_name(PortAddress::new(0, port)),
                            "port_number": port,
                        }),
                    })
                    .collect();
                body.insert("ports_mapping".to_string(), Value::Array(mapping));
            }
            PortLayout::SlotPort { .. } => {
                for slot in 0..geometry.adapters {
                    body.entry(format!("slot{}", slot))
                        .or_insert_with(|| json!(format!("NM-{}FE-TX", geometry.ports_per_adapter)));
                }
            }
        }

        Value::Object(body)
    }
}

impl PortLayout {
    /// Check a requested geometry against this layout
    pub fn validate(&self, geometry: PortGeometry) -> Result<(), OrchestratorError> {
        let PortGeometry {
            adapters,
            ports_per_adapter,
        } = geometry;

        if adapters == 0 || ports_per_adapter == 0 {
            return Err(OrchestratorError::InvalidInput(
                "a node needs at least one port".to_string(),
            ));
        }

        match *self {
            PortLayout::AdapterOnly { max_adapters } => {
                if ports_per_adapter != 1 {
                    return Err(OrchestratorError::InvalidInput(
                        "this node type only supports port 0 on each adapter".to_string(),
                    ));
                }
                if adapters > max_adapters {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "at most {} adapters supported, {} requested",
                        max_adapters, adapters
                    )));
                }
            }
            PortLayout::PortOnly { max_ports } => {
                if adapters != 1 {
                    return Err(OrchestratorError::InvalidInput(
                        "this node type only supports adapter 0".to_string(),
                    ));
                }
                if ports_per_adapter > max_ports {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "at most {} ports supported, {} requested",
                        max_ports, ports_per_adapter
                    )));
                }
            }
            PortLayout::SlotPort {
                max_slots,
                max_ports_per_slot,
            } => {
                if adapters > max_slots || ports_per_adapter > max_ports_per_slot {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "at most {} slots of {} ports supported",
                        max_slots, max_ports_per_slot
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_port_zero_only_layout() {
        let layout = NodeType::Qemu.port_layout();
        assert!(layout.validate(PortGeometry::new(4, 1)).is_ok());

        let err = layout.validate(PortGeometry::new(4, 2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_switch_layout_uses_adapter_zero() {
        let layout = NodeType::EthernetSwitch.port_layout();
        assert!(layout.validate(PortGeometry::new(1, 8)).is_ok());
        assert!(layout.validate(PortGeometry::new(2, 8)).is_err());
    }

    #[test]
    fn test_vpcs_single_port() {
        let layout = NodeType::Vpcs.port_layout();
        assert!(layout.validate(PortGeometry::new(1, 1)).is_ok());
        assert!(layout.validate(PortGeometry::new(2, 1)).is_err());
    }

    #[test]
    fn test_default_geometry_is_valid() {
        for node_type in NodeType::ALL {
            let geometry = node_type.default_geometry();
            assert!(
                node_type.port_layout().validate(geometry).is_ok(),
                "{:?}",
                node_type
            );
        }
    }

    #[test]
    fn test_capabilities() {
        assert!(NodeType::Qemu.capabilities().suspend);
        assert!(!NodeType::Vpcs.capabilities().suspend);
        assert!(NodeType::Dynamips.capabilities().idle_pc);
        assert!(!NodeType::Docker.capabilities().idle_pc);
    }

    #[test]
    fn test_switch_payload_has_ports_mapping() {
        let payload = NodeType::EthernetSwitch.create_payload(
            "sw1",
            "id",
            PortGeometry::new(1, 3),
            &Map::new(),
        );
        assert_eq!(payload["ports_mapping"].as_array().unwrap().len(), 3);
        assert_eq!(payload["ports_mapping"][2]["port_number"], 2);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&NodeType::FrameRelaySwitch).unwrap();
        assert_eq!(json, "\"frame_relay_switch\"");
        let parsed: NodeType = serde_json::from_str("\"vpcs\"").unwrap();
        assert_eq!(parsed, NodeType::Vpcs);
    }
}
