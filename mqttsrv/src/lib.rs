//! Scriptable MQTT server.
//!
//! This crate composes an MQTT broker engine (rumqttd by default) from YAML
//! settings, wires lifecycle handlers and interceptors into it, and exposes
//! a `publish` function to a scripting host so scripts can publish messages
//! through the running broker.
//!
//! # Example
//!
//! ```no_run
//! use giztoy_mqttsrv::{BrokerService, FuncRegistry, Handlers, RumqttdFactory, Settings};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load(None)?;
//!     let handlers = Handlers::from_settings(&settings);
//!     let service = BrokerService::new(settings, &RumqttdFactory, handlers);
//!
//!     let host = FuncRegistry::new();
//!     let _broker = service.start(&host).await?;
//!
//!     let arg = serde_json::json!({"topic": "hello/world", "payload": "hi"});
//!     host.call("publish", arg.into()).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     Ok(())
//! }
//! ```

mod endpoint;
mod engine;
mod error;
mod handlers;
mod payload;
mod publish;
mod rumqttd_engine;
mod script;
mod service;
mod settings;
mod types;

pub use endpoint::{
    DEFAULT_TCP_PORT, DEFAULT_TLS_PORT, DEFAULT_WEBSOCKET_PORT, EncryptedEndpointOptions,
    EndpointConfig, Listener, TcpEndpointOptions, TlsVersion, build_endpoints,
};
pub use engine::{
    BrokerStartConfig, Engine, EngineFactory, TcpAdapter, TransportAdapter, TransportType,
    WebSocketAdapter,
};
pub use error::{Error, Result};
pub use handlers::{
    AllowAll, ApplicationMessageInterceptor, AuditLog, ClientConnectedHandler,
    ClientDisconnectedHandler, ClientSubscribedTopicHandler, ClientUnsubscribedTopicHandler,
    ConnectionValidator, Handlers, Interception, StaticCredentials, SubscriptionInterceptor,
};
pub use payload::{PayloadInput, normalize, normalize_value};
pub use publish::{PublishRequest, Publisher};
pub use rumqttd_engine::{RumqttdEngine, RumqttdFactory, to_rumqttd_config};
pub use script::{FuncRegistry, ScriptFunc, ScriptFuture, ScriptHost, ScriptValue, script_func};
pub use service::{BrokerService, PUBLISH_FUNC_NAME, RunningBroker};
pub use settings::{
    Certificate, CertificateSettings, EncryptedTcpEndpointSettings, Settings,
    TcpEndpointSettings, WebSocketEndpointSettings,
};
pub use types::{ApplicationMessage, QoS};

/// Re-export commonly used items
pub mod prelude {
    pub use crate::{
        ApplicationMessage, BrokerService, Engine, EngineFactory, Error, FuncRegistry, Handlers,
        PublishRequest, Publisher, QoS, Result, RumqttdFactory, ScriptHost, ScriptValue, Settings,
    };
}
