//! Broker composition service.
//!
//! Owns the engine from creation to start:
//!
//! 1. [`BrokerService::new`] creates the transport adapters (TCP and
//!    WebSocket) and asks the factory for an engine bound to them.
//! 2. [`BrokerService::start`] builds the endpoint configuration, merges it
//!    with the handlers and limits, starts the engine and, once it runs,
//!    registers `publish` with the script host.
//!
//! `start` consumes the service, so an engine is started at most once.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::endpoint::build_endpoints;
use crate::engine::{
    BrokerStartConfig, Engine, EngineFactory, TcpAdapter, TransportAdapter, WebSocketAdapter,
};
use crate::error::Result;
use crate::handlers::Handlers;
use crate::publish::Publisher;
use crate::script::ScriptHost;
use crate::settings::Settings;

/// Name the publish capability is registered under.
pub const PUBLISH_FUNC_NAME: &str = "publish";

/// A composed broker that has not been started yet.
pub struct BrokerService<E> {
    settings: Settings,
    handlers: Handlers,
    engine: Arc<E>,
    websocket: Arc<WebSocketAdapter>,
}

impl<E: Engine + 'static> BrokerService<E> {
    /// Create the adapters and the engine.
    pub fn new<F>(settings: Settings, factory: &F, handlers: Handlers) -> Self
    where
        F: EngineFactory<Engine = E>,
    {
        let websocket = Arc::new(WebSocketAdapter::from_settings(
            &settings.web_socket_endpoint,
        ));
        let adapters = vec![
            TransportAdapter::Tcp(TcpAdapter),
            TransportAdapter::WebSocket(websocket.clone()),
        ];
        let engine = Arc::new(factory.create_engine(adapters));
        Self {
            settings,
            handlers,
            engine,
            websocket,
        }
    }

    /// The WebSocket adapter shared with the engine.
    pub fn websocket_adapter(&self) -> Arc<WebSocketAdapter> {
        self.websocket.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start the broker and expose `publish` to scripts.
    ///
    /// Nothing is registered with the script host unless the engine started.
    pub async fn start(self, host: &dyn ScriptHost) -> Result<RunningBroker<E>> {
        let endpoints = build_endpoints(&self.settings)?;
        let config = BrokerStartConfig {
            endpoints,
            max_pending_messages_per_client: self.settings.max_pending_messages_per_client,
            communication_timeout: Duration::from_secs(self.settings.communication_timeout),
            handlers: self.handlers,
        };

        self.engine.start(config).await?;
        info!("MQTT server started.");

        let publisher = Publisher::new(self.engine.clone());
        host.register_func(PUBLISH_FUNC_NAME, publisher.clone().into_script_func())?;

        Ok(RunningBroker {
            engine: self.engine,
            websocket: self.websocket,
            publisher,
        })
    }
}

/// A started broker.
pub struct RunningBroker<E> {
    engine: Arc<E>,
    websocket: Arc<WebSocketAdapter>,
    publisher: Publisher<E>,
}

impl<E: Engine + 'static> RunningBroker<E> {
    /// A publisher bound to the running engine.
    pub fn publisher(&self) -> Publisher<E> {
        self.publisher.clone()
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn websocket_adapter(&self) -> Arc<WebSocketAdapter> {
        self.websocket.clone()
    }
}
