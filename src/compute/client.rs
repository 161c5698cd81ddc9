//! Backend driver interface
//!
//! [`ComputeApi`] is the one operation contract every compute host satisfies,
//! whatever device family a node belongs to. The node's [`NodeType`] only
//! selects the API path segment and payload shape; the controller never
//! branches on it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::host::{ComputeCapabilities, ComputeHost};
use crate::topology::{CaptureSession, Node, NodeStatus, NodeType, PortAddress, TunnelAddress};

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

/// Everything a compute needs to address one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle {
    pub project_id: Uuid,
    pub node_id: Uuid,
    pub node_type: NodeType,
}

impl From<&Node> for NodeHandle {
    fn from(node: &Node) -> Self {
        Self {
            project_id: node.project_id,
            node_id: node.node_id,
            node_type: node.node_type,
        }
    }
}

/// Lifecycle verb forwarded to a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeAction {
    Start,
    Stop,
    Suspend,
    Resume,
    Reload,
}

impl NodeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeAction::Start => "start",
            NodeAction::Stop => "stop",
            NodeAction::Suspend => "suspend",
            NodeAction::Resume => "resume",
            NodeAction::Reload => "reload",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CapabilitiesResponse {
    #[serde(default)]
    node_types: Vec<String>,
    #[serde(default)]
    platform: String,
    #[serde(default)]
    cpus: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct UdpPortResponse {
    udp_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct NodeInfoResponse {
    status: NodeStatus,
}

#[derive(Debug, Clone, Deserialize)]
struct IdlePcResponse {
    idlepc: String,
}

/// Errors returned by a compute driver
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("connection failed: {0}")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("{0} not found on compute")]
    NotFound(String),

    #[error("compute returned {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

// ============================================================================
// SBIO: Trait for abstraction (allows in-memory computes in tests)
// ============================================================================

#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn version(&self) -> Result<VersionInfo, DriverError>;

    async fn capabilities(&self) -> Result<ComputeCapabilities, DriverError>;

    /// Create the backend instance; `payload` comes from [`NodeType::create_payload`]
    async fn create_node(&self, node: &NodeHandle, payload: &Value) -> Result<(), DriverError>;

    async fn update_node(
        &self,
        node: &NodeHandle,
        properties: &Map<String, Value>,
    ) -> Result<(), DriverError>;

    async fn delete_node(&self, node: &NodeHandle) -> Result<(), DriverError>;

    async fn node_action(&self, node: &NodeHandle, action: NodeAction) -> Result<(), DriverError>;

    /// Actual status as the backend sees it
    async fn node_status(&self, node: &NodeHandle) -> Result<NodeStatus, DriverError>;

    /// Reserve a tunnel endpoint for `port`; the compute picks its reachable address
    async fn allocate_endpoint(
        &self,
        node: &NodeHandle,
        port: PortAddress,
    ) -> Result<TunnelAddress, DriverError>;

    /// Activate a previously allocated endpoint, addressed at the peer
    async fn bind_endpoint(
        &self,
        node: &NodeHandle,
        port: PortAddress,
        local: &TunnelAddress,
        remote: &TunnelAddress,
    ) -> Result<(), DriverError>;

    /// Pair two ports living on this compute in one call
    ///
    /// Returns the local addresses of side A and side B.
    async fn pair_local(
        &self,
        a: (&NodeHandle, PortAddress),
        b: (&NodeHandle, PortAddress),
    ) -> Result<(TunnelAddress, TunnelAddress), DriverError>;

    async fn release_endpoint(&self, node: &NodeHandle, port: PortAddress)
        -> Result<(), DriverError>;

    async fn start_capture(
        &self,
        node: &NodeHandle,
        port: PortAddress,
        capture: &CaptureSession,
    ) -> Result<(), DriverError>;

    async fn stop_capture(&self, node: &NodeHandle, port: PortAddress) -> Result<(), DriverError>;

    /// Idle-PC proposal (router emulator only)
    async fn auto_idle_pc(&self, node: &NodeHandle) -> Result<String, DriverError>;

    /// Drop every resource the compute holds for a project
    async fn close_project(&self, project_id: Uuid) -> Result<(), DriverError>;
}

/// Builds the driver used to talk to one registered compute
pub trait ComputeConnector: Send + Sync {
    fn connect(&self, host: &ComputeHost) -> Arc<dyn ComputeApi>;
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct HttpCompute {
    client: reqwest::Client,
    base_url: String,
    address: String,
    user: Option<String>,
    password: Option<String>,
}

impl HttpCompute {
    pub fn new(client: reqwest::Client, host: &ComputeHost) -> Self {
        Self {
            client,
            base_url: host.base_url(),
            address: host.host.clone(),
            user: host.user.clone(),
            password: host.password.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2/compute{}", self.base_url.trim_end_matches('/'), path)
    }

    fn node_path(node: &NodeHandle) -> String {
        format!(
            "/projects/{}/{}/nodes/{}",
            node.project_id,
            node.node_type.api_segment(),
            node.node_id
        )
    }

    fn port_path(node: &NodeHandle, port: PortAddress) -> String {
        format!(
            "{}/adapters/{}/ports/{}",
            Self::node_path(node),
            port.adapter,
            port.port
        )
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
        what: &str,
    ) -> Result<reqwest::Response, DriverError> {
        let url = self.url(path);
        debug!("{} {}", method, url);

        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        if let Some(ref user) = self.user {
            req = req.basic_auth(user, self.password.as_ref());
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                DriverError::Timeout
            } else {
                DriverError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DriverError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
                .unwrap_or(text);
            return Err(DriverError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
        what: &str,
    ) -> Result<T, DriverError> {
        self.send(method, path, body, what)
            .await?
            .json()
            .await
            .map_err(|e| DriverError::InvalidResponse(e.to_string()))
    }

    /// Release endpoints of a pairing that did not complete
    async fn release_quietly(&self, sides: &[(&NodeHandle, PortAddress)]) {
        for (node, port) in sides {
            if let Err(e) = self.release_endpoint(node, *port).await {
                debug!("Endpoint {} of node {} not released: {}", port, node.node_id, e);
            }
        }
    }

    /// Make sure the compute knows the project before nodes are placed in it
    async fn ensure_project(&self, project_id: Uuid) -> Result<(), DriverError> {
        let body = json!({ "project_id": project_id });
        match self
            .send(reqwest::Method::POST, "/projects", Some(&body), "project")
            .await
        {
            Ok(_) | Err(DriverError::Rejected { status: 409, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ComputeApi for HttpCompute {
    async fn version(&self) -> Result<VersionInfo, DriverError> {
        self.send_json(reqwest::Method::GET, "/version", None, "version")
            .await
    }

    async fn capabilities(&self) -> Result<ComputeCapabilities, DriverError> {
        let response: CapabilitiesResponse = self
            .send_json(reqwest::Method::GET, "/capabilities", None, "capabilities")
            .await?;

        // Unknown families on newer computes are skipped, not fatal
        let node_types = response
            .node_types
            .iter()
            .filter_map(|t| serde_json::from_value(Value::String(t.clone())).ok())
            .collect();

        Ok(ComputeCapabilities {
            node_types,
            platform: response.platform,
            cpus: response.cpus,
        })
    }

    async fn create_node(&self, node: &NodeHandle, payload: &Value) -> Result<(), DriverError> {
        self.ensure_project(node.project_id).await?;
        let path = format!(
            "/projects/{}/{}/nodes",
            node.project_id,
            node.node_type.api_segment()
        );
        self.send(reqwest::Method::POST, &path, Some(payload), "project")
            .await?;
        Ok(())
    }

    async fn update_node(
        &self,
        node: &NodeHandle,
        properties: &Map<String, Value>,
    ) -> Result<(), DriverError> {
        let body = Value::Object(properties.clone());
        self.send(
            reqwest::Method::PUT,
            &Self::node_path(node),
            Some(&body),
            "node",
        )
        .await?;
        Ok(())
    }

    async fn delete_node(&self, node: &NodeHandle) -> Result<(), DriverError> {
        self.send(reqwest::Method::DELETE, &Self::node_path(node), None, "node")
            .await?;
        Ok(())
    }

    async fn node_action(&self, node: &NodeHandle, action: NodeAction) -> Result<(), DriverError> {
        let path = format!("{}/{}", Self::node_path(node), action.as_str());
        self.send(reqwest::Method::POST, &path, Some(&json!({})), "node")
            .await?;
        Ok(())
    }

    async fn node_status(&self, node: &NodeHandle) -> Result<NodeStatus, DriverError> {
        let info: NodeInfoResponse = self
            .send_json(reqwest::Method::GET, &Self::node_path(node), None, "node")
            .await?;
        Ok(info.status)
    }

    async fn allocate_endpoint(
        &self,
        node: &NodeHandle,
        _port: PortAddress,
    ) -> Result<TunnelAddress, DriverError> {
        let path = format!("/projects/{}/ports/udp", node.project_id);
        let response: UdpPortResponse = self
            .send_json(reqwest::Method::POST, &path, Some(&json!({})), "project")
            .await?;
        Ok(TunnelAddress::new(self.address.clone(), response.udp_port))
    }

    async fn bind_endpoint(
        &self,
        node: &NodeHandle,
        port: PortAddress,
        local: &TunnelAddress,
        remote: &TunnelAddress,
    ) -> Result<(), DriverError> {
        let path = format!("{}/nio", Self::port_path(node, port));
        let body = json!({
            "type": "nio_udp",
            "lport": local.port,
            "rhost": remote.host,
            "rport": remote.port,
        });
        self.send(reqwest::Method::POST, &path, Some(&body), "port")
            .await?;
        Ok(())
    }

    async fn pair_local(
        &self,
        a: (&NodeHandle, PortAddress),
        b: (&NodeHandle, PortAddress),
    ) -> Result<(TunnelAddress, TunnelAddress), DriverError> {
        let local_a = self.allocate_endpoint(a.0, a.1).await?;
        let local_b = match self.allocate_endpoint(b.0, b.1).await {
            Ok(local_b) => local_b,
            Err(e) => {
                self.release_quietly(&[a]).await;
                return Err(e);
            }
        };
        let loop_a = TunnelAddress::new("127.0.0.1", local_a.port);
        let loop_b = TunnelAddress::new("127.0.0.1", local_b.port);

        let bound = match self.bind_endpoint(a.0, a.1, &loop_a, &loop_b).await {
            Ok(()) => self.bind_endpoint(b.0, b.1, &loop_b, &loop_a).await,
            Err(e) => Err(e),
        };
        if let Err(e) = bound {
            self.release_quietly(&[a, b]).await;
            return Err(e);
        }
        Ok((loop_a, loop_b))
    }

    async fn release_endpoint(
        &self,
        node: &NodeHandle,
        port: PortAddress,
    ) -> Result<(), DriverError> {
        let path = format!("{}/nio", Self::port_path(node, port));
        self.send(reqwest::Method::DELETE, &path, None, "port")
            .await?;
        Ok(())
    }

    async fn start_capture(
        &self,
        node: &NodeHandle,
        port: PortAddress,
        capture: &CaptureSession,
    ) -> Result<(), DriverError> {
        let path = format!("{}/start_capture", Self::port_path(node, port));
        let body = json!({
            "capture_file_name": capture.sink,
            "data_link_type": capture.link_type,
        });
        self.send(reqwest::Method::POST, &path, Some(&body), "port")
            .await?;
        Ok(())
    }

    async fn stop_capture(&self, node: &NodeHandle, port: PortAddress) -> Result<(), DriverError> {
        let path = format!("{}/stop_capture", Self::port_path(node, port));
        self.send(reqwest::Method::POST, &path, Some(&json!({})), "port")
            .await?;
        Ok(())
    }

    async fn auto_idle_pc(&self, node: &NodeHandle) -> Result<String, DriverError> {
        let path = format!("{}/auto_idlepc", Self::node_path(node));
        let response: IdlePcResponse = self
            .send_json(reqwest::Method::GET, &path, None, "node")
            .await?;
        Ok(response.idlepc)
    }

    async fn close_project(&self, project_id: Uuid) -> Result<(), DriverError> {
        let path = format!("/projects/{}/close", project_id);
        self.send(reqwest::Method::POST, &path, Some(&json!({})), "project")
            .await?;
        Ok(())
    }
}

/// Connects every registered compute over HTTP
#[derive(Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ComputeConnector for HttpConnector {
    fn connect(&self, host: &ComputeHost) -> Arc<dyn ComputeApi> {
        Arc::new(HttpCompute::new(self.client.clone(), host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::host::ComputeDescriptor;

    fn handle() -> NodeHandle {
        NodeHandle {
            project_id: Uuid::nil(),
            node_id: Uuid::nil(),
            node_type: NodeType::Dynamips,
        }
    }

    #[test]
    fn test_paths_follow_node_family() {
        let host = ComputeHost::from_descriptor(ComputeDescriptor::new("10.0.0.1", 8001));
        let compute = HttpCompute::new(reqwest::Client::new(), &host);

        let path = HttpCompute::port_path(&handle(), PortAddress::new(1, 0));
        assert_eq!(
            compute.url(&path),
            format!(
                "http://10.0.0.1:8001/v2/compute/projects/{}/dynamips/nodes/{}/adapters/1/ports/0",
                Uuid::nil(),
                Uuid::nil()
            )
        );
    }

    #[tokio::test]
    async fn test_unreachable_compute_reports_connection_failure() {
        // Port 9 (discard) on localhost is closed on any test machine
        let host = ComputeHost::from_descriptor(ComputeDescriptor::new("127.0.0.1", 9));
        let connector = HttpConnector::new(Duration::from_millis(500));
        let compute = connector.connect(&host);

        let err = compute.version().await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::Unreachable(_) | DriverError::Timeout
        ));
    }

    #[test]
    fn test_action_names() {
        assert_eq!(NodeAction::Start.as_str(), "start");
        assert_eq!(NodeAction::Resume.as_str(), "resume");
    }
}
