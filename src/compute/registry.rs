//! Compute Registry - the controller's view of every compute host
//!
//! The registry is the gate in front of every remote call: callers obtain a
//! driver through [`ComputeRegistry::client`], which fails fast with
//! `HostUnreachable` while the host is marked disconnected.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};

use super::client::{ComputeApi, ComputeConnector};
use super::host::{ComputeCapabilities, ComputeDescriptor, ComputeHost, ComputeStatus};
use crate::error::{OrchestratorError, OrchestratorResult};

/// Registered compute hosts and their drivers
#[derive(Clone)]
pub struct ComputeRegistry {
    /// Hosts indexed by compute id
    hosts: Arc<DashMap<String, ComputeHost>>,

    /// Driver per compute id
    clients: Arc<DashMap<String, Arc<dyn ComputeApi>>>,

    connector: Arc<dyn ComputeConnector>,

    /// Held across the identity checks and inserts of one registration
    registering: Arc<Mutex<()>>,

    /// major.minor every compute must report
    protocol_version: String,
}

impl ComputeRegistry {
    pub fn new(connector: Arc<dyn ComputeConnector>, protocol_version: impl Into<String>) -> Self {
        Self {
            hosts: Arc::new(DashMap::new()),
            clients: Arc::new(DashMap::new()),
            connector,
            registering: Arc::new(Mutex::new(())),
            protocol_version: protocol_version.into(),
        }
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Register a host; it starts disconnected until its first probe
    pub fn register(&self, descriptor: ComputeDescriptor) -> OrchestratorResult<ComputeHost> {
        let host = ComputeHost::from_descriptor(descriptor);

        if host.host.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "compute host address is empty".to_string(),
            ));
        }

        let _registering = self
            .registering
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.hosts.contains_key(&host.compute_id) {
            return Err(OrchestratorError::Conflict(format!(
                "compute '{}' already registered",
                host.compute_id
            )));
        }
        if let Some(existing) = self
            .hosts
            .iter()
            .find(|h| h.identity() == host.identity())
        {
            return Err(OrchestratorError::Conflict(format!(
                "{} is already registered as '{}'",
                host.base_url(),
                existing.compute_id
            )));
        }

        let client = self.connector.connect(&host);
        self.clients.insert(host.compute_id.clone(), client);
        self.hosts.insert(host.compute_id.clone(), host.clone());

        info!("Registered compute '{}' at {}", host.compute_id, host.base_url());
        Ok(host)
    }

    pub fn get(&self, compute_id: &str) -> OrchestratorResult<ComputeHost> {
        self.hosts
            .get(compute_id)
            .map(|h| h.clone())
            .ok_or_else(|| OrchestratorError::not_found("Compute", compute_id))
    }

    /// All hosts, sorted by id
    pub fn list(&self) -> Vec<ComputeHost> {
        let mut hosts: Vec<ComputeHost> = self.hosts.iter().map(|r| r.clone()).collect();
        hosts.sort_by(|a, b| a.compute_id.cmp(&b.compute_id));
        hosts
    }

    pub fn ids(&self) -> Vec<String> {
        self.hosts.iter().map(|r| r.key().clone()).collect()
    }

    /// Remove a host; the caller is responsible for its nodes
    pub fn unregister(&self, compute_id: &str) -> OrchestratorResult<ComputeHost> {
        let _registering = self
            .registering
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.clients.remove(compute_id);
        let host = self
            .hosts
            .remove(compute_id)
            .map(|(_, h)| h)
            .ok_or_else(|| OrchestratorError::not_found("Compute", compute_id))?;
        info!("Unregistered compute '{}'", compute_id);
        Ok(host)
    }

    /// Driver for a connected host
    ///
    /// Fails with `NotFound` for unknown ids and `HostUnreachable` when the
    /// host is disconnected; no remote call is attempted in either case.
    pub fn client(&self, compute_id: &str) -> OrchestratorResult<Arc<dyn ComputeApi>> {
        let host = self.get(compute_id)?;
        if !host.is_connected() {
            return Err(OrchestratorError::HostUnreachable(compute_id.to_string()));
        }
        self.probe_client(compute_id)
    }

    /// Driver regardless of status (health probes, best-effort teardown)
    pub fn probe_client(&self, compute_id: &str) -> OrchestratorResult<Arc<dyn ComputeApi>> {
        self.clients
            .get(compute_id)
            .map(|c| c.clone())
            .ok_or_else(|| OrchestratorError::not_found("Compute", compute_id))
    }

    /// Record a successful probe; returns true if the host was disconnected
    pub fn mark_connected(
        &self,
        compute_id: &str,
        version: String,
        capabilities: Option<ComputeCapabilities>,
    ) -> OrchestratorResult<bool> {
        let mut host = self
            .hosts
            .get_mut(compute_id)
            .ok_or_else(|| OrchestratorError::not_found("Compute", compute_id))?;

        let reconnected = host.status == ComputeStatus::Disconnected;
        host.status = ComputeStatus::Connected;
        host.version = Some(version);
        if capabilities.is_some() {
            host.capabilities = capabilities;
        }
        host.last_seen = Some(Utc::now());
        host.last_error = None;

        if reconnected {
            info!("Compute '{}' connected", compute_id);
        }
        Ok(reconnected)
    }

    /// Record a failed probe or call; returns true if the host was connected
    pub fn mark_disconnected(&self, compute_id: &str, error: impl Into<String>) -> bool {
        let Some(mut host) = self.hosts.get_mut(compute_id) else {
            return false;
        };

        let error = error.into();
        let was_connected = host.status == ComputeStatus::Connected;
        host.status = ComputeStatus::Disconnected;
        host.last_error = Some(error.clone());

        if was_connected {
            warn!("Compute '{}' disconnected: {}", compute_id, error);
        }
        was_connected
    }
}
