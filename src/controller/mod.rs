//! Controller - the single source of truth for every project
//!
//! The controller is responsible for:
//! - Tracking compute hosts (through the [`ComputeRegistry`])
//! - Holding each open project's topology and notification stream
//! - Forwarding node, link and capture operations to compute hosts with a
//!   bounded timeout, folding the outcome back into state
//! - Serializing operations per node and per port
//!
//! Every mutation is committed and its event published under the owning
//! project's write lock, so event order is commit order and a snapshot taken
//! under the read lock always matches the stream's sequence number.

mod capture;
mod lifecycle;
mod monitor;
mod projects;
mod saga;
mod wiring;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{OwnedMutexGuard, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compute::{
    health_probe, ComputeConnector, ComputeDescriptor, ComputeHost, ComputeRegistry, DriverError,
    ProbeConfig,
};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::notification::{EventKind, EventStream, Subscription, DEFAULT_CAPACITY};
use crate::topology::{PortRef, Project, Topology};

pub use monitor::spawn_health_monitor;
pub use wiring::LinkOutcome;

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Bound on every call crossing into a compute host
    pub request_timeout: Duration,

    /// How often the health monitor probes every compute
    pub health_check_interval: Duration,

    /// Retry policy of a health probe
    pub probe: ProbeConfig,

    /// Broadcast buffer per notification stream
    pub notification_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
            probe: ProbeConfig::default(),
            notification_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Busy-map entry of a node whose deletion is in flight
pub(crate) const DELETE_OPERATION: &str = "delete";

/// One open project
pub(crate) struct ProjectState {
    pub project: Project,
    pub topology: RwLock<Topology>,
    pub events: EventStream,
}

/// Marks a node as having an operation in flight; released on drop
pub(crate) struct NodeGuard {
    busy: Arc<DashMap<Uuid, &'static str>>,
    node_id: Uuid,
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        self.busy.remove(&self.node_id);
    }
}

/// The controller façade shared by the API, CLI and background tasks
#[derive(Clone)]
pub struct Controller {
    registry: ComputeRegistry,

    /// Open projects indexed by id
    projects: Arc<DashMap<Uuid, Arc<ProjectState>>>,

    /// Nodes with an operation in flight, and which one
    busy_nodes: Arc<DashMap<Uuid, &'static str>>,

    /// Binding lock per port
    port_locks: Arc<DashMap<PortRef, Arc<tokio::sync::Mutex<()>>>>,

    /// Controller-wide stream (computes, project open/close)
    events: Arc<EventStream>,

    config: Arc<ControllerConfig>,
}

impl Controller {
    pub fn new(
        connector: Arc<dyn ComputeConnector>,
        protocol_version: impl Into<String>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            registry: ComputeRegistry::new(connector, protocol_version),
            projects: Arc::new(DashMap::new()),
            busy_nodes: Arc::new(DashMap::new()),
            port_locks: Arc::new(DashMap::new()),
            events: Arc::new(EventStream::new(None, config.notification_capacity)),
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &ComputeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Subscribe to compute and project-level events
    pub fn subscribe_controller(&self, resume_from: Option<u64>) -> Option<Subscription> {
        self.events.subscribe(resume_from)
    }

    // =========================================================================
    // Compute Management
    // =========================================================================

    /// Register a compute and probe it once
    ///
    /// A failed first probe leaves the host registered but disconnected; the
    /// health monitor keeps trying.
    pub async fn add_compute(&self, descriptor: ComputeDescriptor) -> OrchestratorResult<ComputeHost> {
        let host = self.registry.register(descriptor)?;
        self.events.publish(EventKind::ComputeCreated, &host);

        if let Err(e) = self.probe_compute(&host.compute_id).await {
            warn!("Initial probe of compute '{}' failed: {}", host.compute_id, e);
        }
        self.registry.get(&host.compute_id)
    }

    pub fn list_computes(&self) -> Vec<ComputeHost> {
        self.registry.list()
    }

    pub fn get_compute(&self, compute_id: &str) -> OrchestratorResult<ComputeHost> {
        self.registry.get(compute_id)
    }

    /// Probe a compute now, publishing `compute.updated` on any change
    ///
    /// A host coming back triggers status reconciliation of its nodes.
    pub async fn probe_compute(&self, compute_id: &str) -> OrchestratorResult<ComputeHost> {
        let before = self.registry.get(compute_id)?;
        let result = health_probe(&self.registry, compute_id, self.config.probe).await;
        let after = self.registry.get(compute_id)?;

        if before.status != after.status || before.version != after.version {
            self.events.publish(EventKind::ComputeUpdated, &after);
        }

        let outcome = result?;
        if outcome.reconnected {
            self.reconcile_compute(compute_id).await;
        }
        Ok(outcome.host)
    }

    /// Unregister a compute
    ///
    /// Fails with `Conflict` while nodes remain on it unless `force` is set,
    /// in which case those nodes and their links are dropped from controller
    /// state. Link endpoints are released best-effort on both sides while
    /// the host is still registered; the nodes themselves are never deleted
    /// on it.
    pub async fn remove_compute(&self, compute_id: &str, force: bool) -> OrchestratorResult<()> {
        self.registry.get(compute_id)?;

        let mut hosted = Vec::new();
        for state in self.open_projects() {
            let nodes = state.topology.read().await.nodes_on(compute_id);
            if !nodes.is_empty() {
                hosted.push((state, nodes));
            }
        }

        if !hosted.is_empty() && !force {
            let count: usize = hosted.iter().map(|(_, n)| n.len()).sum();
            return Err(OrchestratorError::Conflict(format!(
                "compute '{}' still hosts {} node(s)",
                compute_id, count
            )));
        }

        for (state, nodes) in hosted {
            self.orphan_nodes(&state, &nodes).await;
        }

        let host = self.registry.unregister(compute_id)?;
        self.events.publish(EventKind::ComputeDeleted, &host);
        Ok(())
    }

    // =========================================================================
    // Shared plumbing
    // =========================================================================

    pub(crate) fn project_state(&self, project_id: Uuid) -> OrchestratorResult<Arc<ProjectState>> {
        self.projects
            .get(&project_id)
            .map(|p| Arc::clone(&p))
            .ok_or_else(|| OrchestratorError::not_found("Project", project_id))
    }

    pub(crate) fn open_projects(&self) -> Vec<Arc<ProjectState>> {
        self.projects.iter().map(|p| Arc::clone(&p)).collect()
    }

    /// Claim a node for one operation; a second claimant gets `Conflict`
    pub(crate) fn claim_node(&self, node_id: Uuid, operation: &'static str) -> OrchestratorResult<NodeGuard> {
        match self.busy_nodes.entry(node_id) {
            Entry::Occupied(busy) => Err(OrchestratorError::Conflict(format!(
                "node {} is busy: {} in progress",
                node_id,
                busy.get()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(operation);
                Ok(NodeGuard {
                    busy: Arc::clone(&self.busy_nodes),
                    node_id,
                })
            }
        }
    }

    /// `Conflict` if any of `ports` belongs to a node being deleted
    pub(crate) fn ensure_not_deleting(&self, ports: &[PortRef]) -> OrchestratorResult<()> {
        for port in ports {
            let deleting = self
                .busy_nodes
                .get(&port.node_id)
                .map(|op| *op == DELETE_OPERATION)
                .unwrap_or(false);
            if deleting {
                return Err(OrchestratorError::Conflict(format!(
                    "node {} is being deleted",
                    port.node_id
                )));
            }
        }
        Ok(())
    }

    /// Acquire the binding locks of `ports` in global order
    ///
    /// Callers resolve the ports first, so entries only exist for ports of
    /// known nodes; they are dropped when the node is deleted or its project
    /// closed.
    pub(crate) async fn lock_ports(&self, ports: &[PortRef]) -> Vec<OwnedMutexGuard<()>> {
        let mut ordered = ports.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for port in ordered {
            let lock = self
                .port_locks
                .entry(port)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    pub(crate) fn forget_port_locks(&self, node_id: Uuid) {
        self.port_locks.retain(|port, _| port.node_id != node_id);
    }

    /// Run `task` to completion even if the caller goes away
    ///
    /// Local state is only advanced once the remote outcome is known, so the
    /// work must not be dropped halfway through a caller's cancellation.
    pub(crate) async fn detached<T, F>(&self, task: F) -> OrchestratorResult<T>
    where
        F: Future<Output = OrchestratorResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(task)
            .await
            .map_err(|e| OrchestratorError::Internal(format!("operation aborted: {}", e)))?
    }

    /// Bounded call into a compute host
    pub(crate) async fn remote<T>(
        &self,
        compute_id: &str,
        operation: &str,
        call: impl Future<Output = Result<T, DriverError>>,
    ) -> OrchestratorResult<T> {
        match timeout(self.config.request_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.driver_error(compute_id, operation, e)),
            Err(_) => Err(self.timed_out(compute_id, operation)),
        }
    }

    /// Bounded teardown call; a resource already gone counts as released
    pub(crate) async fn remote_release(
        &self,
        compute_id: &str,
        operation: &str,
        call: impl Future<Output = Result<(), DriverError>>,
    ) -> OrchestratorResult<()> {
        match timeout(self.config.request_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(DriverError::NotFound(what))) => {
                debug!(
                    "{} already gone on compute '{}' during {}",
                    what, compute_id, operation
                );
                Ok(())
            }
            Ok(Err(e)) => Err(self.driver_error(compute_id, operation, e)),
            Err(_) => Err(self.timed_out(compute_id, operation)),
        }
    }

    fn timed_out(&self, compute_id: &str, operation: &str) -> OrchestratorError {
        warn!("Compute '{}' timed out during {}", compute_id, operation);
        OrchestratorError::Timeout {
            compute: compute_id.to_string(),
            operation: operation.to_string(),
            secs: self.config.request_timeout.as_secs(),
        }
    }

    fn driver_error(&self, compute_id: &str, operation: &str, err: DriverError) -> OrchestratorError {
        match err {
            DriverError::Unreachable(detail) => {
                self.note_unreachable(compute_id, &detail);
                OrchestratorError::HostUnreachable(compute_id.to_string())
            }
            DriverError::Timeout => self.timed_out(compute_id, operation),
            other => {
                warn!("Compute '{}' failed to {}: {}", compute_id, operation, other);
                OrchestratorError::BackendFailure {
                    compute: compute_id.to_string(),
                    operation: operation.to_string(),
                    detail: other.to_string(),
                }
            }
        }
    }

    /// A call found the host gone; later calls fail fast until it is probed back
    fn note_unreachable(&self, compute_id: &str, detail: &str) {
        if self.registry.mark_disconnected(compute_id, detail) {
            if let Ok(host) = self.registry.get(compute_id) {
                self.events.publish(EventKind::ComputeUpdated, &host);
            }
        }
    }

    /// Reconcile every node of a compute that just came back
    async fn reconcile_compute(&self, compute_id: &str) {
        for state in self.open_projects() {
            let nodes = state.topology.read().await.nodes_on(compute_id);
            for node_id in nodes {
                if let Err(e) = self.reconcile_node(state.project.project_id, node_id).await {
                    debug!("Skipped reconciling node {}: {}", node_id, e);
                }
            }
        }
        info!("Reconciled nodes of compute '{}'", compute_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::SimulatedConnector;
    use crate::error::ErrorKind;
    use crate::notification::StreamItem;
    use crate::topology::{LinkState, Node, NodeRequest, NodeStatus, NodeType};
    use tokio::time::sleep;

    /// Controller with computes `h1` and `h2`, and an open project
    async fn two_hosts() -> (Controller, SimulatedConnector, Uuid) {
        let (controller, connector) = controller();
        for (id, address) in [("h1", "10.0.0.1"), ("h2", "10.0.0.2")] {
            controller
                .add_compute(ComputeDescriptor::new(address, 8001).with_id(id))
                .await
                .unwrap();
        }
        let project_id = controller.open_project("lab", None).unwrap().project_id;
        (controller, connector, project_id)
    }

    async fn vpcs(controller: &Controller, project_id: Uuid, name: &str, compute: &str) -> Node {
        controller
            .create_node(project_id, NodeRequest::new(name, NodeType::Vpcs, compute))
            .await
            .unwrap()
    }

    fn port0(node: &Node) -> PortRef {
        PortRef::new(node.node_id, 0, 0)
    }

    async fn next_kind(sub: &mut Subscription) -> EventKind {
        match timeout(Duration::from_secs(1), sub.next()).await {
            Ok(Some(StreamItem::Event(e))) => e.kind,
            other => panic!("expected an event, got {:?}", other),
        }
    }

    pub(crate) fn controller() -> (Controller, SimulatedConnector) {
        let connector = SimulatedConnector::new();
        let config = ControllerConfig {
            request_timeout: Duration::from_millis(500),
            probe: ProbeConfig {
                timeout: Duration::from_millis(200),
                retries: 0,
                backoff: Duration::from_millis(1),
            },
            ..Default::default()
        };
        let controller = Controller::new(Arc::new(connector.clone()), "2.2", config);
        (controller, connector)
    }

    #[tokio::test]
    async fn test_add_compute_probes_it() {
        let (controller, _) = controller();
        let host = controller
            .add_compute(ComputeDescriptor::new("10.0.0.1", 8001).with_id("h1"))
            .await
            .unwrap();
        assert!(host.is_connected());
        assert_eq!(controller.list_computes().len(), 1);
    }

    #[tokio::test]
    async fn test_add_unreachable_compute_stays_registered() {
        let (controller, connector) = controller();
        connector.compute("h1").set_reachable(false);

        let host = controller
            .add_compute(ComputeDescriptor::new("10.0.0.1", 8001).with_id("h1"))
            .await
            .unwrap();
        assert!(!host.is_connected());
    }

    #[tokio::test]
    async fn test_compute_events_are_published() {
        let (controller, _) = controller();
        let mut sub = controller.subscribe_controller(None).unwrap();

        controller
            .add_compute(ComputeDescriptor::new("10.0.0.1", 8001).with_id("h1"))
            .await
            .unwrap();
        controller.remove_compute("h1", false).await.unwrap();

        let mut kinds = Vec::new();
        for _ in 0..3 {
            if let Some(crate::notification::StreamItem::Event(e)) = sub.next().await {
                kinds.push(e.kind);
            }
        }
        assert_eq!(
            kinds,
            vec![
                EventKind::ComputeCreated,
                EventKind::ComputeUpdated,
                EventKind::ComputeDeleted
            ]
        );
    }

    #[test]
    fn test_claim_node_conflicts() {
        let (controller, _) = controller();
        let node_id = Uuid::new_v4();

        let guard = controller.claim_node(node_id, "start").unwrap();
        let err = controller.claim_node(node_id, "stop").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        drop(guard);
        assert!(controller.claim_node(node_id, "stop").is_ok());
    }

    #[tokio::test]
    async fn test_unknown_compute() {
        let (controller, _) = controller();
        let err = controller.remove_compute("nope", true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_remove_compute_with_nodes_conflicts() {
        let (controller, _, project_id) = two_hosts().await;
        vpcs(&controller, project_id, "pc1", "h1").await;

        let err = controller.remove_compute("h1", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(controller.get_compute("h1").is_ok());
        assert_eq!(controller.list_nodes(project_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_forced_removal_orphans_nodes_and_links() {
        let (controller, connector, project_id) = two_hosts().await;
        let a = vpcs(&controller, project_id, "pc1", "h1").await;
        let b = vpcs(&controller, project_id, "pc2", "h2").await;
        controller
            .create_link(project_id, port0(&a), port0(&b))
            .await
            .unwrap();

        let (_, mut project_events) = controller.subscribe(project_id, None).await.unwrap();
        let mut controller_events = controller.subscribe_controller(None).unwrap();

        controller.remove_compute("h2", true).await.unwrap();

        assert_eq!(next_kind(&mut project_events).await, EventKind::LinkDeleted);
        assert_eq!(next_kind(&mut project_events).await, EventKind::NodeDeleted);
        assert_eq!(next_kind(&mut controller_events).await, EventKind::ComputeDeleted);

        let snapshot = controller.snapshot(project_id).await.unwrap();
        assert!(snapshot.links.is_empty());
        assert_eq!(snapshot.nodes.len(), 1);
        assert!(!snapshot.nodes[0].ports[0].is_bound());
        assert!(controller.get_compute("h2").is_err());

        // The peer endpoint is released; the orphaned node is left on its host
        assert_eq!(connector.compute("h1").endpoint_count(), 0);
        assert!(connector.compute("h2").has_node(b.node_id));
    }

    #[tokio::test]
    async fn test_cancelled_start_still_settles() {
        let (controller, connector, project_id) = two_hosts().await;
        let node = vpcs(&controller, project_id, "pc1", "h1").await;
        let compute = connector.compute("h1");
        compute.set_latency(Duration::from_millis(200));

        let cancelled = timeout(
            Duration::from_millis(50),
            controller.start_node(project_id, node.node_id),
        )
        .await;
        assert!(cancelled.is_err());

        // The detached start still owns the node
        let err = controller.stop_node(project_id, node.node_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        sleep(Duration::from_millis(300)).await;
        let settled = controller.get_node(project_id, node.node_id).await.unwrap();
        assert_eq!(settled.status, NodeStatus::Started);

        compute.set_latency(Duration::ZERO);
        let stopped = controller.stop_node(project_id, node.node_id).await.unwrap();
        assert_eq!(stopped.status, NodeStatus::Stopped);
    }

    #[tokio::test]
    async fn test_cancelled_link_creation_completes() {
        let (controller, connector, project_id) = two_hosts().await;
        let a = vpcs(&controller, project_id, "pc1", "h1").await;
        let b = vpcs(&controller, project_id, "pc2", "h2").await;
        connector.compute("h2").set_latency(Duration::from_millis(100));

        let cancelled = timeout(
            Duration::from_millis(50),
            controller.create_link(project_id, port0(&a), port0(&b)),
        )
        .await;
        assert!(cancelled.is_err());

        sleep(Duration::from_millis(500)).await;
        let links = controller.list_links(project_id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].state, LinkState::Established);
        for node in [&a, &b] {
            let node = controller.get_node(project_id, node.node_id).await.unwrap();
            assert_eq!(node.ports[0].link_id, Some(links[0].link_id));
        }
    }

    #[tokio::test]
    async fn test_port_locks_follow_known_ports() {
        let (controller, _, project_id) = two_hosts().await;
        let a = vpcs(&controller, project_id, "pc1", "h1").await;
        let b = vpcs(&controller, project_id, "pc2", "h1").await;

        let ghost = PortRef::new(Uuid::new_v4(), 0, 0);
        let err = controller
            .start_capture(project_id, ghost, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = controller.stop_capture(project_id, ghost).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = controller
            .create_link(project_id, port0(&a), ghost)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(controller.port_locks.is_empty());

        controller
            .create_link(project_id, port0(&a), port0(&b))
            .await
            .unwrap();
        assert_eq!(controller.port_locks.len(), 2);

        controller.close_project(project_id).await.unwrap();
        assert!(controller.port_locks.is_empty());
    }
}
