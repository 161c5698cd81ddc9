//! Compute hosts: registry, driver interface and health probing

pub mod client;
pub mod health;
pub mod host;
pub mod registry;
pub mod simulated;

pub use client::{
    ComputeApi, ComputeConnector, DriverError, HttpCompute, HttpConnector, NodeAction, NodeHandle,
    VersionInfo,
};
pub use health::{health_probe, ProbeConfig, ProbeOutcome};
pub use host::{
    version_compatible, ComputeCapabilities, ComputeDescriptor, ComputeHost, ComputeStatus,
    Protocol,
};
pub use registry::ComputeRegistry;
pub use simulated::{SimulatedCompute, SimulatedConnector, SimulatedOp};

/// Protocol version (major.minor) computes must report
pub const DEFAULT_PROTOCOL_VERSION: &str = "2.2";

/// Default port of a compute host API
pub const DEFAULT_COMPUTE_PORT: u16 = 3080;

/// Default probe retries after the first failure
pub const DEFAULT_PROBE_RETRIES: u32 = 3;

/// Default base backoff between probe attempts
pub const DEFAULT_PROBE_BACKOFF_MS: u64 = 500;
