//! Transport endpoints (NIOs)
//!
//! A NIO describes how bytes move for one bound port. It is owned by the
//! port and lives as long as the link or capture session that created it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reachable address of one tunnel end, as chosen by its compute host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelAddress {
    pub host: String,
    pub port: u16,
}

impl TunnelAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for TunnelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A packet capture tee attached to a transport endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSession {
    /// Destination sink identifier (capture file name)
    pub sink: String,

    /// Link-layer type of the captured frames
    #[serde(rename = "linkType")]
    pub link_type: String,

    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
}

impl CaptureSession {
    pub fn new(sink: impl Into<String>, link_type: impl Into<String>) -> Self {
        Self {
            sink: sink.into(),
            link_type: link_type.into(),
            started_at: Utc::now(),
        }
    }
}

/// Mechanism binding a port to a byte stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Nio {
    /// Both ends live on the same compute, paired by it in one call
    Paired {
        local: TunnelAddress,
        remote: TunnelAddress,
    },

    /// One end of a host-to-host tunnel, addressed at the peer compute
    Tunnel {
        local: TunnelAddress,
        remote: TunnelAddress,
    },

    /// Another endpoint with frames teed to a capture sink
    Captured {
        inner: Box<Nio>,
        capture: CaptureSession,
    },
}

impl Nio {
    /// The underlying transport, ignoring any capture wrapper
    pub fn transport(&self) -> &Nio {
        match self {
            Nio::Captured { inner, .. } => inner.transport(),
            other => other,
        }
    }

    pub fn capture(&self) -> Option<&CaptureSession> {
        match self {
            Nio::Captured { capture, .. } => Some(capture),
            _ => None,
        }
    }

    pub fn is_cross_host(&self) -> bool {
        matches!(self.transport(), Nio::Tunnel { .. })
    }

    pub fn local(&self) -> &TunnelAddress {
        match self.transport() {
            Nio::Paired { local, .. } | Nio::Tunnel { local, .. } => local,
            Nio::Captured { inner, .. } => inner.local(),
        }
    }

    pub fn remote(&self) -> &TunnelAddress {
        match self.transport() {
            Nio::Paired { remote, .. } | Nio::Tunnel { remote, .. } => remote,
            Nio::Captured { inner, .. } => inner.remote(),
        }
    }

    /// Wrap this endpoint with a capture tee; the transport is untouched
    pub fn with_capture(self, capture: CaptureSession) -> Nio {
        let inner = self.without_capture().0;
        Nio::Captured {
            inner: Box::new(inner),
            capture,
        }
    }

    /// Strip the capture tee, returning the transport and the removed session
    pub fn without_capture(self) -> (Nio, Option<CaptureSession>) {
        match self {
            Nio::Captured { inner, capture } => (inner.without_capture().0, Some(capture)),
            other => (other, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel() -> Nio {
        Nio::Tunnel {
            local: TunnelAddress::new("10.0.0.1", 10000),
            remote: TunnelAddress::new("10.0.0.2", 20000),
        }
    }

    #[test]
    fn test_capture_wraps_without_changing_transport() {
        let nio = tunnel().with_capture(CaptureSession::new("r1.pcap", "DLT_EN10MB"));

        assert_eq!(nio.transport(), &tunnel());
        assert_eq!(nio.capture().unwrap().sink, "r1.pcap");
        assert!(nio.is_cross_host());
        assert_eq!(nio.remote().to_string(), "10.0.0.2:20000");

        let (plain, session) = nio.without_capture();
        assert_eq!(plain, tunnel());
        assert!(session.is_some());
    }

    #[test]
    fn test_rewrapping_replaces_capture() {
        let nio = tunnel()
            .with_capture(CaptureSession::new("a.pcap", "DLT_EN10MB"))
            .with_capture(CaptureSession::new("b.pcap", "DLT_EN10MB"));

        assert_eq!(nio.capture().unwrap().sink, "b.pcap");
        assert_eq!(nio.transport(), &tunnel());
    }

    #[test]
    fn test_nio_serialization() {
        let json = serde_json::to_value(tunnel()).unwrap();
        assert_eq!(json["type"], "tunnel");
        assert_eq!(json["remote"]["port"], 20000);
    }
}
