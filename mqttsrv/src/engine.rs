//! Broker engine capability surface.
//!
//! The MQTT protocol itself (sessions, QoS flows, retained messages) lives in
//! an engine behind the [`Engine`] trait. The server only needs to start it
//! once with a finished [`BrokerStartConfig`] and to publish messages
//! through it afterwards.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::endpoint::{DEFAULT_WEBSOCKET_PORT, EndpointConfig, port_override};
use crate::error::Result;
use crate::handlers::Handlers;
use crate::settings::WebSocketEndpointSettings;
use crate::types::ApplicationMessage;

/// Everything an engine needs to start.
#[derive(Debug, Clone)]
pub struct BrokerStartConfig {
    /// Listener section.
    pub endpoints: EndpointConfig,
    /// Maximum queued outgoing messages per client.
    pub max_pending_messages_per_client: usize,
    /// Idle client timeout enforced by the engine.
    pub communication_timeout: Duration,
    /// Lifecycle handlers and interceptors.
    pub handlers: Handlers,
}

/// An MQTT broker engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Start the engine. Returns once the engine is running or has failed.
    ///
    /// Called at most once per engine.
    async fn start(&self, config: BrokerStartConfig) -> Result<()>;

    /// Publish a message to subscribers. Returns once the engine accepted it.
    async fn publish(&self, message: ApplicationMessage) -> Result<()>;
}

/// Creates engines bound to a set of transport adapters.
pub trait EngineFactory {
    type Engine: Engine + 'static;

    fn create_engine(&self, adapters: Vec<TransportAdapter>) -> Self::Engine;
}

/// Transport type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Plain or TLS TCP connections.
    Tcp,
    /// WebSocket connections.
    WebSocket,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Tcp => write!(f, "tcp"),
            TransportType::WebSocket => write!(f, "websocket"),
        }
    }
}

/// A transport the engine accepts clients on.
#[derive(Debug, Clone)]
pub enum TransportAdapter {
    Tcp(TcpAdapter),
    WebSocket(Arc<WebSocketAdapter>),
}

impl TransportAdapter {
    pub fn transport_type(&self) -> TransportType {
        match self {
            TransportAdapter::Tcp(_) => TransportType::Tcp,
            TransportAdapter::WebSocket(_) => TransportType::WebSocket,
        }
    }
}

/// TCP transport. Serves both the plain and the TLS endpoint; which of
/// them open is decided by the endpoint configuration.
#[derive(Debug, Clone, Default)]
pub struct TcpAdapter;

/// WebSocket transport.
///
/// Shared between the engine and any web hosting integration that wants to
/// hand WebSocket clients to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketAdapter {
    listen: Option<SocketAddr>,
}

impl WebSocketAdapter {
    /// An adapter with no listener of its own.
    pub fn detached() -> Self {
        Self { listen: None }
    }

    /// An adapter listening on `addr`.
    pub fn listening(addr: SocketAddr) -> Self {
        Self { listen: Some(addr) }
    }

    /// Build from settings. A disabled endpoint yields a detached adapter.
    pub fn from_settings(settings: &WebSocketEndpointSettings) -> Self {
        if !settings.enabled {
            return Self::detached();
        }
        let ip = settings.try_read_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
        let port = port_override(settings.port).unwrap_or(DEFAULT_WEBSOCKET_PORT);
        Self::listening(SocketAddr::new(IpAddr::V4(ip), port))
    }

    /// Address the engine should accept WebSocket clients on, if any.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen
    }
}
