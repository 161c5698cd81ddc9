//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::ServeArgs;
use crate::api::{create_router, ApiState, ErrorBody};
use crate::compute::{
    ComputeApi, ComputeConnector, ComputeDescriptor, ComputeHost, HttpConnector, Protocol,
    SimulatedConnector,
};
use crate::config::{
    load_settings_from, resolve_credentials, validate_settings, ConfigError, ControllerSettings,
};
use crate::controller::{spawn_health_monitor, Controller};
use crate::topology::Node;

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Server error: {0}")]
    Server(String),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Serve (Pure helpers)
// ============================================================================

/// Apply command-line overrides on top of file settings
pub fn apply_overrides(mut settings: ControllerSettings, args: &ServeArgs) -> ControllerSettings {
    if let Some(ref bind_addr) = args.bind_addr {
        settings.bind_addr = bind_addr.clone();
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    settings
}

/// Descriptor of the simulated compute standing for this machine
pub fn local_compute_descriptor(hostname: &str) -> ComputeDescriptor {
    let mut descriptor = ComputeDescriptor::new("127.0.0.1", 0).with_id(hostname);
    descriptor.name = Some(hostname.to_string());
    descriptor
}

fn machine_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "local".to_string())
}

/// Simulates one compute, and reaches every other through `remote`
struct LocalFirstConnector {
    local_id: String,
    simulated: SimulatedConnector,
    remote: Arc<dyn ComputeConnector>,
}

impl ComputeConnector for LocalFirstConnector {
    fn connect(&self, host: &ComputeHost) -> Arc<dyn ComputeApi> {
        if host.compute_id == self.local_id {
            self.simulated.connect(host)
        } else {
            self.remote.connect(host)
        }
    }
}

/// Build a controller from settings and register its computes
pub async fn build_controller(
    settings: &ControllerSettings,
    simulate: bool,
    local_compute: bool,
) -> CommandResult<Controller> {
    let config = settings.controller_config();
    let remote: Arc<dyn ComputeConnector> = if simulate {
        Arc::new(SimulatedConnector::new())
    } else {
        Arc::new(HttpConnector::new(config.probe.timeout))
    };

    let local_id = machine_hostname();
    let connector: Arc<dyn ComputeConnector> = if local_compute {
        Arc::new(LocalFirstConnector {
            local_id: local_id.clone(),
            simulated: SimulatedConnector::new(),
            remote,
        })
    } else {
        remote
    };

    let controller = Controller::new(connector, settings.protocol_version.clone(), config);

    if local_compute {
        let host = controller
            .add_compute(local_compute_descriptor(&local_id))
            .await
            .map_err(|e| CommandError::Server(e.to_string()))?;
        info!("Registered local compute '{}'", host.compute_id);
    }

    for descriptor in &settings.computes {
        let descriptor = resolve_credentials(descriptor)?;
        match controller.add_compute(descriptor).await {
            Ok(host) => info!("Registered compute '{}' ({:?})", host.compute_id, host.status),
            Err(e) => warn!("Could not register compute: {}", e),
        }
    }

    Ok(controller)
}

// ============================================================================
// Serve (I/O)
// ============================================================================

/// Run the controller until interrupted
pub async fn serve(args: &ServeArgs) -> CommandResult<()> {
    let settings = match args.config {
        Some(ref path) => load_settings_from(path)?,
        None => crate::config::load_settings()?,
    };
    let settings = apply_overrides(settings, args);
    validate_settings(&settings)?;

    let controller = build_controller(&settings, args.simulate, args.local_compute).await?;

    let cancel = CancellationToken::new();
    let monitor = spawn_health_monitor(
        controller.clone(),
        controller.config().health_check_interval,
        cancel.clone(),
    );

    let addr = settings.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Controller listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health              - Health check");
    info!("  GET  /v2/computes         - Compute hosts");
    info!("  GET  /v2/projects         - Open projects");
    info!("  GET  /v2/notifications    - Controller events");

    let app = create_router(ApiState::new(controller));
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    let _ = monitor.await;
    Ok(())
}

// ============================================================================
// Validate Commands
// ============================================================================

/// Validate a settings file
pub fn validate_settings_file(path: &Path) -> ValidationResult {
    let checked = load_settings_from(path).and_then(|settings| {
        validate_settings(&settings)?;
        Ok(settings)
    });
    match checked {
        Ok(settings) => ValidationResult {
            valid: true,
            computes: settings.computes.len(),
            listen: settings.listen_addr(),
            error: None,
        },
        Err(e) => ValidationResult {
            valid: false,
            computes: 0,
            listen: String::new(),
            error: Some(e.to_string()),
        },
    }
}

/// Result of validating a settings file
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub computes: usize,
    pub listen: String,
    pub error: Option<String>,
}

// ============================================================================
// HTTP Client for the Controller
// ============================================================================

/// Websocket URL of a project's notification stream
pub fn watch_url(base_url: &str, project_id: Uuid, resume_from: Option<u64>) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };

    let mut url = format!("{}/v2/projects/{}/notifications/ws", base, project_id);
    if let Some(seq) = resume_from {
        url.push_str(&format!("?resumeFrom={}", seq));
    }
    url
}

/// Client for a running controller
pub struct ControllerClient {
    client: reqwest::Client,
    base_url: String,
}

impl ControllerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn build_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client.request(method, &url)
    }

    /// Turn a non-success response into the controller's error message
    async fn check(resp: reqwest::Response) -> CommandResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = match resp.json::<ErrorBody>().await {
            Ok(body) => format!("{:?}: {}", body.kind, body.message),
            Err(_) => status.to_string(),
        };
        Err(CommandError::Server(message))
    }

    pub async fn list_computes(&self) -> CommandResult<Vec<ComputeHost>> {
        let resp = self
            .build_request(reqwest::Method::GET, "/v2/computes")
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn add_compute(&self, descriptor: &ComputeDescriptor) -> CommandResult<ComputeHost> {
        let resp = self
            .build_request(reqwest::Method::POST, "/v2/computes")
            .json(descriptor)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn remove_compute(&self, compute_id: &str, force: bool) -> CommandResult<()> {
        let path = format!("/v2/computes/{}?force={}", compute_id, force);
        let resp = self
            .build_request(reqwest::Method::DELETE, &path)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    pub async fn probe_compute(&self, compute_id: &str) -> CommandResult<ComputeHost> {
        let path = format!("/v2/computes/{}/probe", compute_id);
        let resp = self
            .build_request(reqwest::Method::POST, &path)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn list_nodes(&self, project_id: Uuid) -> CommandResult<Vec<Node>> {
        let path = format!("/v2/projects/{}/nodes", project_id);
        let resp = self
            .build_request(reqwest::Method::GET, &path)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }
}

/// Build the descriptor of `netlab compute add`
pub fn compute_descriptor(
    host: String,
    port: u16,
    id: Option<String>,
    name: Option<String>,
    https: bool,
    user: Option<String>,
    password: Option<String>,
) -> ComputeDescriptor {
    let mut descriptor = ComputeDescriptor::new(host, port);
    descriptor.compute_id = id;
    descriptor.name = name;
    descriptor.user = user;
    descriptor.password = password;
    if https {
        descriptor = descriptor.with_protocol(Protocol::Https);
    }
    descriptor
}

/// Follow a notification websocket, handing every JSON item to `on_item`
pub async fn watch(
    url: &str,
    mut on_item: impl FnMut(serde_json::Value),
) -> CommandResult<()> {
    let (mut socket, _) = connect_async(url)
        .await
        .map_err(|e| CommandError::WebSocket(e.to_string()))?;

    while let Some(message) = socket.next().await {
        let message = message.map_err(|e| CommandError::WebSocket(e.to_string()))?;
        match message {
            Message::Text(_) => {
                let text = message
                    .to_text()
                    .map_err(|e| CommandError::WebSocket(e.to_string()))?;
                on_item(serde_json::from_str(text)?);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_overrides_win() {
        let args = ServeArgs {
            bind_addr: Some("127.0.0.1".to_string()),
            port: Some(9000),
            ..Default::default()
        };
        let settings = apply_overrides(ControllerSettings::default(), &args);
        assert_eq!(settings.listen_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_watch_url() {
        let project = Uuid::nil();
        assert_eq!(
            watch_url("http://127.0.0.1:3080/", project, None),
            format!("ws://127.0.0.1:3080/v2/projects/{}/notifications/ws", project)
        );
        assert!(watch_url("https://lab", project, Some(7)).starts_with("wss://lab/"));
        assert!(watch_url("https://lab", project, Some(7)).ends_with("?resumeFrom=7"));
    }

    #[test]
    fn test_validate_settings_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"port: 4000\ncomputes:\n  - host: 10.0.0.1\n    port: 3080\n")
            .unwrap();
        let result = validate_settings_file(file.path());
        assert!(result.valid, "{:?}", result.error);
        assert_eq!(result.computes, 1);

        let result = validate_settings_file(Path::new("/nonexistent/controller.yaml"));
        assert!(result.valid);
        assert_eq!(result.computes, 0);
    }

    #[test]
    fn test_compute_descriptor_https() {
        let descriptor = compute_descriptor(
            "10.0.0.1".to_string(),
            3080,
            Some("h1".to_string()),
            None,
            true,
            None,
            None,
        );
        assert_eq!(descriptor.protocol, Protocol::Https);
        assert_eq!(descriptor.compute_id.as_deref(), Some("h1"));
    }

    #[tokio::test]
    async fn test_build_controller_with_local_compute() {
        let settings = ControllerSettings::default();
        let controller = build_controller(&settings, true, true).await.unwrap();

        let computes = controller.list_computes();
        assert_eq!(computes.len(), 1);
        assert!(computes[0].is_connected());
    }
}
