//! In-memory compute host
//!
//! Keeps just enough backend state (node status, endpoints, captures) to
//! answer the driver contract the way a real compute would. Used by
//! `netlab serve --simulate` and by tests, which also use the fault
//! injection knobs: an unreachable switch, one-shot rejections and latency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::trace;
use uuid::Uuid;

use super::client::{ComputeApi, ComputeConnector, DriverError, NodeAction, NodeHandle, VersionInfo};
use super::host::{ComputeCapabilities, ComputeHost};
use crate::topology::{CaptureSession, NodeStatus, NodeType, PortAddress, TunnelAddress};

/// First tunnel port handed out by a simulated compute
const FIRST_TUNNEL_PORT: u16 = 10000;

/// Driver operations, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedOp {
    Version,
    Capabilities,
    CreateNode,
    UpdateNode,
    DeleteNode,
    NodeAction,
    NodeStatus,
    AllocateEndpoint,
    BindEndpoint,
    PairLocal,
    ReleaseEndpoint,
    StartCapture,
    StopCapture,
    AutoIdlePc,
    CloseProject,
}

#[derive(Debug, Clone)]
struct SimNode {
    project_id: Uuid,
    node_type: NodeType,
    status: NodeStatus,
}

/// Endpoint as the simulated backend holds it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimEndpoint {
    pub local: TunnelAddress,
    /// `None` until bound to a peer
    pub remote: Option<TunnelAddress>,
}

type PortKey = (Uuid, PortAddress);

#[derive(Default)]
struct SimState {
    nodes: HashMap<Uuid, SimNode>,
    endpoints: HashMap<PortKey, SimEndpoint>,
    captures: HashMap<PortKey, CaptureSession>,
    next_port: u16,
    calls: Vec<SimulatedOp>,
}

impl SimState {
    fn drop_port_state(&mut self, node_id: Uuid) {
        self.endpoints.retain(|(id, _), _| *id != node_id);
        self.captures.retain(|(id, _), _| *id != node_id);
    }

    fn next_address(&mut self, host: &str) -> TunnelAddress {
        let port = FIRST_TUNNEL_PORT.saturating_add(self.next_port);
        self.next_port = self.next_port.wrapping_add(1);
        TunnelAddress::new(host, port)
    }
}

fn rejected(status: u16, message: impl Into<String>) -> DriverError {
    DriverError::Rejected {
        status,
        message: message.into(),
    }
}

/// A compute host living entirely in controller memory
pub struct SimulatedCompute {
    address: String,
    version: Mutex<String>,
    node_types: Vec<NodeType>,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
    failures: Mutex<HashMap<SimulatedOp, String>>,
    state: Mutex<SimState>,
}

impl SimulatedCompute {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            version: Mutex::new(format!("{}.0", super::DEFAULT_PROTOCOL_VERSION)),
            node_types: NodeType::ALL.to_vec(),
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            failures: Mutex::new(HashMap::new()),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Restrict the node families this compute advertises
    pub fn with_node_types(mut self, node_types: Vec<NodeType>) -> Self {
        self.node_types = node_types;
        self
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_version(&self, version: impl Into<String>) {
        *lock(&self.version) = version.into();
    }

    /// Reject the next call of `op` with `message`
    pub fn fail_next(&self, op: SimulatedOp, message: impl Into<String>) {
        lock(&self.failures).insert(op, message.into());
    }

    /// Change a node's status behind the controller's back
    pub fn set_node_status(&self, node_id: Uuid, status: NodeStatus) {
        if let Some(node) = lock(&self.state).nodes.get_mut(&node_id) {
            node.status = status;
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn has_node(&self, node_id: Uuid) -> bool {
        lock(&self.state).nodes.contains_key(&node_id)
    }

    pub fn status_of(&self, node_id: Uuid) -> Option<NodeStatus> {
        lock(&self.state).nodes.get(&node_id).map(|n| n.status)
    }

    pub fn endpoint(&self, node_id: Uuid, port: PortAddress) -> Option<SimEndpoint> {
        lock(&self.state).endpoints.get(&(node_id, port)).cloned()
    }

    pub fn endpoint_count(&self) -> usize {
        lock(&self.state).endpoints.len()
    }

    pub fn capture(&self, node_id: Uuid, port: PortAddress) -> Option<CaptureSession> {
        lock(&self.state).captures.get(&(node_id, port)).cloned()
    }

    /// Every call that reached the backend, in order
    pub fn calls(&self) -> Vec<SimulatedOp> {
        lock(&self.state).calls.clone()
    }

    /// Gate shared by every operation: latency, reachability, injected failure
    async fn enter(&self, op: SimulatedOp) -> Result<(), DriverError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(DriverError::Unreachable(format!(
                "{} is not answering",
                self.address
            )));
        }

        lock(&self.state).calls.push(op);
        trace!("Simulated compute {} handling {:?}", self.address, op);

        if let Some(message) = lock(&self.failures).remove(&op) {
            return Err(rejected(500, message));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ComputeApi for SimulatedCompute {
    async fn version(&self) -> Result<VersionInfo, DriverError> {
        self.enter(SimulatedOp::Version).await?;
        Ok(VersionInfo {
            version: lock(&self.version).clone(),
        })
    }

    async fn capabilities(&self) -> Result<ComputeCapabilities, DriverError> {
        self.enter(SimulatedOp::Capabilities).await?;
        Ok(ComputeCapabilities {
            node_types: self.node_types.clone(),
            platform: "simulated".to_string(),
            cpus: 4,
        })
    }

    async fn create_node(&self, node: &NodeHandle, _payload: &Value) -> Result<(), DriverError> {
        self.enter(SimulatedOp::CreateNode).await?;
        if !self.node_types.contains(&node.node_type) {
            return Err(rejected(
                400,
                format!("{} is not available here", node.node_type.api_segment()),
            ));
        }

        let mut state = lock(&self.state);
        if state.nodes.contains_key(&node.node_id) {
            return Err(rejected(409, "node already exists"));
        }
        state.nodes.insert(
            node.node_id,
            SimNode {
                project_id: node.project_id,
                node_type: node.node_type,
                status: NodeStatus::Stopped,
            },
        );
        Ok(())
    }

    async fn update_node(
        &self,
        node: &NodeHandle,
        _properties: &Map<String, Value>,
    ) -> Result<(), DriverError> {
        self.enter(SimulatedOp::UpdateNode).await?;
        if lock(&self.state).nodes.contains_key(&node.node_id) {
            Ok(())
        } else {
            Err(DriverError::NotFound("node".to_string()))
        }
    }

    async fn delete_node(&self, node: &NodeHandle) -> Result<(), DriverError> {
        self.enter(SimulatedOp::DeleteNode).await?;
        let mut state = lock(&self.state);
        state
            .nodes
            .remove(&node.node_id)
            .ok_or_else(|| DriverError::NotFound("node".to_string()))?;
        state.drop_port_state(node.node_id);
        Ok(())
    }

    async fn node_action(&self, node: &NodeHandle, action: NodeAction) -> Result<(), DriverError> {
        self.enter(SimulatedOp::NodeAction).await?;
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let sim = state
            .nodes
            .get_mut(&node.node_id)
            .ok_or_else(|| DriverError::NotFound("node".to_string()))?;

        match action {
            NodeAction::Start | NodeAction::Resume => sim.status = NodeStatus::Started,
            NodeAction::Stop => {
                sim.status = NodeStatus::Stopped;
                let node_id = node.node_id;
                state.captures.retain(|(id, _), _| *id != node_id);
            }
            NodeAction::Suspend => {
                if !sim.node_type.capabilities().suspend {
                    return Err(rejected(400, "suspend is not supported"));
                }
                if sim.status != NodeStatus::Started {
                    return Err(rejected(409, "node is not running"));
                }
                sim.status = NodeStatus::Suspended;
            }
            NodeAction::Reload => {}
        }
        Ok(())
    }

    async fn node_status(&self, node: &NodeHandle) -> Result<NodeStatus, DriverError> {
        self.enter(SimulatedOp::NodeStatus).await?;
        lock(&self.state)
            .nodes
            .get(&node.node_id)
            .map(|n| n.status)
            .ok_or_else(|| DriverError::NotFound("node".to_string()))
    }

    async fn allocate_endpoint(
        &self,
        node: &NodeHandle,
        port: PortAddress,
    ) -> Result<TunnelAddress, DriverError> {
        self.enter(SimulatedOp::AllocateEndpoint).await?;
        let mut state = lock(&self.state);
        if !state.nodes.contains_key(&node.node_id) {
            return Err(DriverError::NotFound("node".to_string()));
        }

        let local = state.next_address(&self.address);
        state.endpoints.insert(
            (node.node_id, port),
            SimEndpoint {
                local: local.clone(),
                remote: None,
            },
        );
        Ok(local)
    }

    async fn bind_endpoint(
        &self,
        node: &NodeHandle,
        port: PortAddress,
        local: &TunnelAddress,
        remote: &TunnelAddress,
    ) -> Result<(), DriverError> {
        self.enter(SimulatedOp::BindEndpoint).await?;
        let mut state = lock(&self.state);
        match state.endpoints.get_mut(&(node.node_id, port)) {
            Some(endpoint) if &endpoint.local == local => {
                endpoint.remote = Some(remote.clone());
                Ok(())
            }
            _ => Err(rejected(409, format!("endpoint {} was not allocated", local))),
        }
    }

    async fn pair_local(
        &self,
        a: (&NodeHandle, PortAddress),
        b: (&NodeHandle, PortAddress),
    ) -> Result<(TunnelAddress, TunnelAddress), DriverError> {
        self.enter(SimulatedOp::PairLocal).await?;
        let mut state = lock(&self.state);
        if !state.nodes.contains_key(&a.0.node_id) || !state.nodes.contains_key(&b.0.node_id) {
            return Err(DriverError::NotFound("node".to_string()));
        }

        let local_a = state.next_address("127.0.0.1");
        let local_b = state.next_address("127.0.0.1");
        state.endpoints.insert(
            (a.0.node_id, a.1),
            SimEndpoint {
                local: local_a.clone(),
                remote: Some(local_b.clone()),
            },
        );
        state.endpoints.insert(
            (b.0.node_id, b.1),
            SimEndpoint {
                local: local_b.clone(),
                remote: Some(local_a.clone()),
            },
        );
        Ok((local_a, local_b))
    }

    async fn release_endpoint(
        &self,
        node: &NodeHandle,
        port: PortAddress,
    ) -> Result<(), DriverError> {
        self.enter(SimulatedOp::ReleaseEndpoint).await?;
        let mut state = lock(&self.state);
        let key = (node.node_id, port);
        state.captures.remove(&key);
        state
            .endpoints
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| DriverError::NotFound("nio".to_string()))
    }

    async fn start_capture(
        &self,
        node: &NodeHandle,
        port: PortAddress,
        capture: &CaptureSession,
    ) -> Result<(), DriverError> {
        self.enter(SimulatedOp::StartCapture).await?;
        let mut state = lock(&self.state);
        let key = (node.node_id, port);

        let running = state
            .nodes
            .get(&node.node_id)
            .map(|n| n.status == NodeStatus::Started)
            .ok_or_else(|| DriverError::NotFound("node".to_string()))?;
        if !running {
            return Err(rejected(409, "node is not running"));
        }
        match state.endpoints.get(&key) {
            Some(endpoint) if endpoint.remote.is_some() => {}
            _ => return Err(DriverError::NotFound("nio".to_string())),
        }
        if state.captures.contains_key(&key) {
            return Err(rejected(409, "capture already running"));
        }

        state.captures.insert(key, capture.clone());
        Ok(())
    }

    async fn stop_capture(&self, node: &NodeHandle, port: PortAddress) -> Result<(), DriverError> {
        self.enter(SimulatedOp::StopCapture).await?;
        lock(&self.state)
            .captures
            .remove(&(node.node_id, port))
            .map(|_| ())
            .ok_or_else(|| DriverError::NotFound("capture".to_string()))
    }

    async fn auto_idle_pc(&self, node: &NodeHandle) -> Result<String, DriverError> {
        self.enter(SimulatedOp::AutoIdlePc).await?;
        let state = lock(&self.state);
        let sim = state
            .nodes
            .get(&node.node_id)
            .ok_or_else(|| DriverError::NotFound("node".to_string()))?;
        if sim.node_type != NodeType::Dynamips {
            return Err(rejected(400, "idle-pc is only computed for router emulators"));
        }
        if sim.status != NodeStatus::Started {
            return Err(rejected(409, "node is not running"));
        }
        Ok("0x60bec828".to_string())
    }

    async fn close_project(&self, project_id: Uuid) -> Result<(), DriverError> {
        self.enter(SimulatedOp::CloseProject).await?;
        let mut state = lock(&self.state);
        let closed: Vec<Uuid> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.project_id == project_id)
            .map(|(id, _)| *id)
            .collect();
        for node_id in closed {
            state.nodes.remove(&node_id);
            state.drop_port_state(node_id);
        }
        Ok(())
    }
}

/// Backs every registered compute with a [`SimulatedCompute`]
///
/// Instances are keyed by compute id, so a test can grab (or pre-create)
/// the simulator behind a host and inject faults into it.
#[derive(Clone, Default)]
pub struct SimulatedConnector {
    computes: Arc<DashMap<String, Arc<SimulatedCompute>>>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The simulator behind `compute_id`, created on first use
    pub fn compute(&self, compute_id: &str) -> Arc<SimulatedCompute> {
        self.computes
            .entry(compute_id.to_string())
            .or_insert_with(|| Arc::new(SimulatedCompute::new(compute_id)))
            .clone()
    }

    /// Place a preconfigured simulator behind `compute_id`
    pub fn insert(&self, compute_id: &str, compute: SimulatedCompute) -> Arc<SimulatedCompute> {
        let compute = Arc::new(compute);
        self.computes
            .insert(compute_id.to_string(), Arc::clone(&compute));
        compute
    }
}

impl ComputeConnector for SimulatedConnector {
    fn connect(&self, host: &ComputeHost) -> Arc<dyn ComputeApi> {
        let compute: Arc<SimulatedCompute> = self
            .computes
            .entry(host.compute_id.clone())
            .or_insert_with(|| Arc::new(SimulatedCompute::new(host.host.clone())))
            .clone();
        compute
    }
}
