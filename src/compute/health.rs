//! Compute health probing
//!
//! A probe asks the compute for its version with a bounded number of
//! retries, validates it against the controller's protocol version and
//! folds the outcome into the registry. Transient network errors are
//! retried here and nowhere else; callers only see the terminal outcome.

use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};

use super::client::DriverError;
use super::host::{version_compatible, ComputeHost};
use super::registry::ComputeRegistry;
use crate::error::{OrchestratorError, OrchestratorResult};

/// Retry policy for a single probe
#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    /// Bound on each version request
    pub timeout: Duration,
    /// Extra attempts after the first failure
    pub retries: u32,
    /// Base delay between attempts, multiplied by the attempt number
    pub backoff: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: super::DEFAULT_PROBE_RETRIES,
            backoff: Duration::from_millis(super::DEFAULT_PROBE_BACKOFF_MS),
        }
    }
}

/// Result of a successful probe
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub host: ComputeHost,
    /// The host was disconnected before this probe
    pub reconnected: bool,
}

/// Probe one compute and update its registry entry
///
/// Marks the host disconnected and returns `HostUnreachable`/`Timeout` when
/// every attempt fails, or `VersionMismatch` when it answers with an
/// incompatible version.
pub async fn health_probe(
    registry: &ComputeRegistry,
    compute_id: &str,
    config: ProbeConfig,
) -> OrchestratorResult<ProbeOutcome> {
    let client = registry.probe_client(compute_id)?;

    let mut last_error = DriverError::Timeout;
    let mut version = None;

    for attempt in 0..=config.retries {
        if attempt > 0 {
            sleep(config.backoff * attempt).await;
        }
        match timeout(config.timeout, client.version()).await {
            Ok(Ok(info)) => {
                version = Some(info.version);
                break;
            }
            Ok(Err(e)) => {
                trace!("Probe {} of '{}' failed: {}", attempt + 1, compute_id, e);
                last_error = e;
            }
            Err(_) => {
                trace!("Probe {} of '{}' timed out", attempt + 1, compute_id);
                last_error = DriverError::Timeout;
            }
        }
    }

    let Some(version) = version else {
        registry.mark_disconnected(compute_id, last_error.to_string());
        return Err(match last_error {
            DriverError::Timeout => OrchestratorError::Timeout {
                compute: compute_id.to_string(),
                operation: "report its version".to_string(),
                secs: config.timeout.as_secs(),
            },
            _ => OrchestratorError::HostUnreachable(compute_id.to_string()),
        });
    };

    let expected = registry.protocol_version();
    if !version_compatible(&version, expected) {
        warn!(
            "Compute '{}' reports version {}, expected {}",
            compute_id, version, expected
        );
        registry.mark_disconnected(compute_id, format!("incompatible version {}", version));
        return Err(OrchestratorError::VersionMismatch {
            compute: compute_id.to_string(),
            found: version,
            expected: expected.to_string(),
        });
    }

    // Capabilities are informational; a failure here keeps the previous set
    let capabilities = match timeout(config.timeout, client.capabilities()).await {
        Ok(Ok(caps)) => Some(caps),
        Ok(Err(e)) => {
            debug!("Compute '{}' did not report capabilities: {}", compute_id, e);
            None
        }
        Err(_) => None,
    };

    let reconnected = registry.mark_connected(compute_id, version, capabilities)?;
    Ok(ProbeOutcome {
        host: registry.get(compute_id)?,
        reconnected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::host::{ComputeDescriptor, ComputeStatus};
    use crate::compute::simulated::{SimulatedConnector, SimulatedOp};
    use crate::error::ErrorKind;
    use std::sync::Arc;

    fn fast() -> ProbeConfig {
        ProbeConfig {
            timeout: Duration::from_millis(200),
            retries: 2,
            backoff: Duration::from_millis(1),
        }
    }

    fn setup() -> (ComputeRegistry, SimulatedConnector) {
        let connector = SimulatedConnector::new();
        let registry = ComputeRegistry::new(Arc::new(connector.clone()), "2.2");
        registry
            .register(ComputeDescriptor::new("10.0.0.1", 8001).with_id("h1"))
            .unwrap();
        (registry, connector)
    }

    #[tokio::test]
    async fn test_probe_connects_and_records_capabilities() {
        let (registry, _) = setup();

        let outcome = health_probe(&registry, "h1", fast()).await.unwrap();
        assert!(outcome.reconnected);
        assert_eq!(outcome.host.status, ComputeStatus::Connected);
        assert!(outcome.host.capabilities.is_some());
        assert!(outcome.host.last_seen.is_some());

        let again = health_probe(&registry, "h1", fast()).await.unwrap();
        assert!(!again.reconnected);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (registry, connector) = setup();
        connector
            .compute("h1")
            .fail_next(SimulatedOp::Version, "flaky");

        let outcome = health_probe(&registry, "h1", fast()).await.unwrap();
        assert!(outcome.host.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_host_marked_disconnected() {
        let (registry, connector) = setup();
        health_probe(&registry, "h1", fast()).await.unwrap();

        connector.compute("h1").set_reachable(false);
        let err = health_probe(&registry, "h1", fast()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::HostUnreachable);
        let host = registry.get("h1").unwrap();
        assert_eq!(host.status, ComputeStatus::Disconnected);
        assert!(host.last_error.is_some());
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (registry, connector) = setup();
        connector.compute("h1").set_version("3.0.1");

        let err = health_probe(&registry, "h1", fast()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
        assert!(!registry.get("h1").unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_slow_host_times_out() {
        let (registry, connector) = setup();
        connector
            .compute("h1")
            .set_latency(Duration::from_millis(500));

        let config = ProbeConfig {
            timeout: Duration::from_millis(20),
            retries: 0,
            backoff: Duration::from_millis(1),
        };
        let err = health_probe(&registry, "h1", config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
