//! Compute host resource - a worker machine that runs device backends
//!
//! A ComputeHost:
//! - Is registered explicitly by an operator (or from the settings file)
//! - Is probed periodically; its status flips between connected/disconnected
//! - Advertises a version and a capability set once reachable
//! - Is only removed by an explicit unregister

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::topology::NodeType;

/// Wire protocol used to reach a compute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Https => f.write_str("https"),
        }
    }
}

/// Liveness of a compute as last observed by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ComputeStatus {
    Connected,
    #[default]
    Disconnected,
}

/// What a compute reports it can run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ComputeCapabilities {
    #[serde(rename = "nodeTypes", default)]
    pub node_types: Vec<NodeType>,

    #[serde(default)]
    pub platform: String,

    #[serde(default)]
    pub cpus: u32,
}

/// Registration request for a compute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeDescriptor {
    /// Stable identifier (derived from host:port when omitted)
    #[serde(rename = "computeId", default, skip_serializing_if = "Option::is_none")]
    pub compute_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub protocol: Protocol,

    pub host: String,

    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ComputeDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            compute_id: None,
            name: None,
            protocol: Protocol::Http,
            host: host.into(),
            port,
            user: None,
            password: None,
        }
    }

    pub fn with_id(mut self, compute_id: impl Into<String>) -> Self {
        self.compute_id = Some(compute_id.into());
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }
}

/// A registered compute host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeHost {
    #[serde(rename = "computeId")]
    pub compute_id: String,

    pub name: String,

    pub protocol: Protocol,

    pub host: String,

    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Never echoed back to clients
    #[serde(skip_serializing, default)]
    pub password: Option<String>,

    pub status: ComputeStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<ComputeCapabilities>,

    #[serde(rename = "lastSeen", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,

    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ComputeHost {
    /// Build a disconnected host from a registration request
    pub fn from_descriptor(descriptor: ComputeDescriptor) -> Self {
        let compute_id = descriptor
            .compute_id
            .unwrap_or_else(|| format!("{}:{}", descriptor.host, descriptor.port));
        let name = descriptor.name.unwrap_or_else(|| compute_id.clone());

        Self {
            compute_id,
            name,
            protocol: descriptor.protocol,
            host: descriptor.host,
            port: descriptor.port,
            user: descriptor.user,
            password: descriptor.password,
            status: ComputeStatus::Disconnected,
            version: None,
            capabilities: None,
            last_seen: None,
            last_error: None,
        }
    }

    /// The (protocol, host, port) triple two registrations may not share
    pub fn identity(&self) -> (Protocol, &str, u16) {
        (self.protocol, self.host.as_str(), self.port)
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.status == ComputeStatus::Connected
    }

    /// Whether this host can run `node_type`
    ///
    /// Unknown capabilities (never probed) do not block creation.
    pub fn supports(&self, node_type: NodeType) -> bool {
        match &self.capabilities {
            Some(caps) if !caps.node_types.is_empty() => caps.node_types.contains(&node_type),
            _ => true,
        }
    }
}

/// Whether a compute's version matches the controller's protocol version
///
/// Only major.minor are compared; patch levels may differ.
pub fn version_compatible(found: &str, expected: &str) -> bool {
    fn major_minor(v: &str) -> Option<(u32, u32)> {
        let v = v.trim().trim_start_matches('v');
        let mut parts = v.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts
            .next()
            .map(|m| {
                m.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
            })
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);
        Some((major, minor))
    }

    match (major_minor(found), major_minor(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
