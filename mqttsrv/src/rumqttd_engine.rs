//! Broker engine backed by rumqttd.
//!
//! The broker runs on its own thread (`Broker::start` blocks). Messages the
//! server publishes go through a local broker link owned by a second thread;
//! [`RumqttdEngine::publish`] hands each message to that thread and waits
//! for the link to accept it.
//!
//! rumqttd surfaces fewer hooks than [`Handlers`] has slots. The connection
//! validator becomes rumqttd's external auth (and an accepted connection
//! fires the connected handler); the application message interceptor runs
//! on every message published through the engine. The remaining slots are
//! kept but never called, which is reported once at start.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use rumqttd::protocol::{Packet, Publish};
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings, TlsConfig};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::endpoint::Listener;
use crate::engine::{BrokerStartConfig, Engine, EngineFactory, TransportAdapter};
use crate::error::{Error, Result};
use crate::handlers::{ApplicationMessageInterceptor, Handlers, Interception};
use crate::settings::Certificate;
use crate::types::{ApplicationMessage, QoS};

/// Client id of the broker link used for server-side publishes.
const LINK_CLIENT_ID: &str = "mqttsrv-publisher";

/// How long `start` waits for the broker thread to fail before treating
/// the broker as running.
const STARTUP_WINDOW: Duration = Duration::from_millis(200);

/// Capacity of the queue between `publish` callers and the link thread.
const PUBLISH_QUEUE: usize = 1024;

/// Max incoming packet size in bytes.
const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

type AuthHandler = Arc<dyn Fn(String, String, String) -> BoxFuture<'static, bool> + Send + Sync>;

/// Creates [`RumqttdEngine`]s.
#[derive(Debug, Clone, Default)]
pub struct RumqttdFactory;

impl EngineFactory for RumqttdFactory {
    type Engine = RumqttdEngine;

    fn create_engine(&self, adapters: Vec<TransportAdapter>) -> RumqttdEngine {
        RumqttdEngine::new(adapters)
    }
}

struct Outgoing {
    message: ApplicationMessage,
    ack: oneshot::Sender<std::result::Result<(), String>>,
}

struct Link {
    tx: mpsc::Sender<Outgoing>,
    interceptor: Arc<dyn ApplicationMessageInterceptor>,
}

/// MQTT broker engine running an embedded rumqttd broker.
pub struct RumqttdEngine {
    adapters: Vec<TransportAdapter>,
    started: AtomicBool,
    link: OnceLock<Link>,
}

impl RumqttdEngine {
    pub fn new(adapters: Vec<TransportAdapter>) -> Self {
        Self {
            adapters,
            started: AtomicBool::new(false),
            link: OnceLock::new(),
        }
    }

    /// Transport adapters this engine serves.
    pub fn adapters(&self) -> &[TransportAdapter] {
        &self.adapters
    }

    /// Check if the broker is running.
    pub fn is_running(&self) -> bool {
        self.link.get().is_some()
    }
}

#[async_trait]
impl Engine for RumqttdEngine {
    async fn start(&self, config: BrokerStartConfig) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let rumqttd_config = to_rumqttd_config(&self.adapters, &config)?;
        let listeners = listen_addrs(&rumqttd_config);
        if listeners.is_empty() {
            warn!("no listeners configured, broker is only reachable through the server");
        }
        check_listen_addrs(&listeners)?;
        report_unsurfaced(&config);

        let broker = Broker::new(rumqttd_config);
        let (mut link_tx, link_rx) = broker
            .link(LINK_CLIENT_ID)
            .map_err(|e| Error::EngineStart(format!("broker link: {}", e)))?;

        let (done_tx, done_rx) = oneshot::channel();
        thread::Builder::new()
            .name("rumqttd".to_string())
            .spawn(move || {
                let mut broker = broker;
                let result = broker.start().map_err(|e| e.to_string());
                if let Err(ref e) = result {
                    error!("broker stopped: {}", e);
                }
                let _ = done_tx.send(result);
            })
            .map_err(|e| Error::EngineStart(e.to_string()))?;

        match tokio::time::timeout(STARTUP_WINDOW, done_rx).await {
            // Still running after the startup window.
            Err(_) => {}
            Ok(Ok(Err(e))) => return Err(Error::EngineStart(e)),
            Ok(_) => {
                return Err(Error::EngineStart(
                    "broker stopped during startup".to_string(),
                ));
            }
        }

        let (tx, mut rx) = mpsc::channel::<Outgoing>(PUBLISH_QUEUE);
        thread::Builder::new()
            .name("rumqttd-link".to_string())
            .spawn(move || {
                // Dropping the receiving half would detach the link from the router.
                let _link_rx = link_rx;
                while let Some(out) = rx.blocking_recv() {
                    let message = out.message;
                    let publish =
                        Publish::new(Bytes::from(message.topic), message.payload, message.retain);
                    // `LinkTx::send` never awaits; the router queue is synchronous.
                    let result = futures::executor::block_on(
                        link_tx.send(Packet::Publish(publish, None)),
                    )
                    .map(|_| ())
                    .map_err(|e| e.to_string());
                    let _ = out.ack.send(result);
                }
                debug!("publish link closed");
            })
            .map_err(|e| Error::EngineStart(e.to_string()))?;

        for (name, addr) in &listeners {
            info!("{} listener on {}", name, addr);
        }

        let link = Link {
            tx,
            interceptor: config.handlers.application_message_interceptor.clone(),
        };
        if self.link.set(link).is_err() {
            return Err(Error::AlreadyStarted);
        }
        Ok(())
    }

    async fn publish(&self, message: ApplicationMessage) -> Result<()> {
        let link = self.link.get().ok_or(Error::NotRunning)?;

        let message = match link.interceptor.intercept_application_message(None, message) {
            Interception::Accept(m) => m,
            Interception::Reject => {
                debug!("server publish rejected by interceptor");
                return Ok(());
            }
        };
        if message.qos != QoS::AtMostOnce {
            debug!(
                topic = %message.topic,
                qos = %message.qos,
                "broker link publishes at qos 0"
            );
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        link.tx
            .send(Outgoing {
                message,
                ack: ack_tx,
            })
            .await
            .map_err(|_| Error::EnginePublish("publish link closed".to_string()))?;
        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::EnginePublish(e)),
            Err(_) => Err(Error::EnginePublish("publish link dropped message".to_string())),
        }
    }
}

/// Map a start configuration onto a rumqttd broker config.
pub fn to_rumqttd_config(
    adapters: &[TransportAdapter],
    config: &BrokerStartConfig,
) -> Result<Config> {
    let mut v4 = HashMap::new();
    let mut ws = HashMap::new();
    let timeout_ms = connection_timeout_ms(config.communication_timeout);

    for adapter in adapters {
        match adapter {
            TransportAdapter::Tcp(_) => {
                if let Listener::Enabled(opts) = &config.endpoints.tcp {
                    let addrs = opts.listen_addrs();
                    for (name, addr) in ["tcp", "tcp-v6"].into_iter().zip(addrs) {
                        v4.insert(name.to_string(), server(name, addr, None, timeout_ms, config));
                    }
                }
                if let Listener::Enabled(opts) = &config.endpoints.encrypted {
                    let addrs = opts.listen_addrs();
                    for (name, addr) in ["tls", "tls-v6"].into_iter().zip(addrs) {
                        let tls = tls_config(&opts.certificate)?;
                        let settings = server(name, addr, Some(tls), timeout_ms, config);
                        v4.insert(name.to_string(), settings);
                    }
                }
            }
            TransportAdapter::WebSocket(adapter) => {
                if let Some(addr) = adapter.listen_addr() {
                    ws.insert("ws".to_string(), server("ws", addr, None, timeout_ms, config));
                }
            }
        }
    }

    Ok(Config {
        id: 0,
        router: RouterConfig {
            max_connections: 10000,
            max_outgoing_packet_count: 200,
            max_segment_size: 1024 * 1024,
            max_segment_count: 10,
            ..Default::default()
        },
        v4: Some(v4),
        v5: None,
        ws: if ws.is_empty() { None } else { Some(ws) },
        prometheus: None,
        metrics: None,
        console: None,
        bridge: None,
        cluster: None,
    })
}

fn server(
    name: &str,
    listen: SocketAddr,
    tls: Option<TlsConfig>,
    timeout_ms: u16,
    config: &BrokerStartConfig,
) -> ServerSettings {
    ServerSettings {
        name: name.to_string(),
        listen,
        tls,
        next_connection_delay_ms: 1,
        connections: ConnectionSettings {
            connection_timeout_ms: timeout_ms,
            max_payload_size: MAX_PAYLOAD_SIZE,
            max_inflight_count: config.max_pending_messages_per_client,
            auth: None,
            external_auth: external_auth(&config.handlers),
            dynamic_filters: false,
        },
    }
}

/// rumqttd keeps the connection timeout in a `u16` of milliseconds.
fn connection_timeout_ms(timeout: Duration) -> u16 {
    match u16::try_from(timeout.as_millis()) {
        Ok(ms) => ms,
        Err(_) => {
            warn!(
                configured_ms = timeout.as_millis() as u64,
                applied_ms = u16::MAX,
                "communication timeout exceeds rumqttd's limit, clamping"
            );
            u16::MAX
        }
    }
}

fn tls_config(certificate: &Certificate) -> Result<TlsConfig> {
    serde_json::from_value(json!({
        "certpath": certificate.cert_path().to_string_lossy(),
        "keypath": certificate.key_path().to_string_lossy(),
    }))
    .map_err(|e| Error::EngineStart(format!("tls config: {}", e)))
}

/// Wire the connection validator into rumqttd. Validators that do not
/// require credentials are left out so anonymous clients can connect.
fn external_auth(handlers: &Handlers) -> Option<AuthHandler> {
    if !handlers.connection_validator.requires_credentials() {
        return None;
    }
    let validator = handlers.connection_validator.clone();
    let connected = handlers.client_connected.clone();
    let auth: AuthHandler = Arc::new(
        move |client_id: String, username: String, password: String| -> BoxFuture<'static, bool> {
            let ok = validator.validate_connection(&client_id, &username, password.as_bytes());
            if ok {
                connected.handle_client_connected(&client_id);
            }
            Box::pin(async move { ok })
        },
    );
    Some(auth)
}

fn listen_addrs(config: &Config) -> Vec<(String, SocketAddr)> {
    let mut addrs: Vec<(String, SocketAddr)> = config
        .v4
        .iter()
        .chain(config.ws.iter())
        .flatten()
        .map(|(name, server)| (name.clone(), server.listen))
        .collect();
    addrs.sort();
    addrs
}

/// Fail early on addresses rumqttd could not bind. Every socket stays
/// open until the last one is bound, so listeners that collide with each
/// other are caught too.
fn check_listen_addrs(listeners: &[(String, SocketAddr)]) -> Result<()> {
    let mut bound = Vec::with_capacity(listeners.len());
    for (name, addr) in listeners {
        let socket = TcpListener::bind(addr)
            .map_err(|e| Error::EngineStart(format!("{} listener on {}: {}", name, addr, e)))?;
        bound.push(socket);
    }
    drop(bound);
    Ok(())
}

fn report_unsurfaced(config: &BrokerStartConfig) {
    warn!(
        "rumqttd does not report disconnect, subscribe or unsubscribe events; \
         those handlers and the subscription interceptor are not called"
    );
    if !config.handlers.connection_validator.requires_credentials() {
        debug!("connected handler is only called for authenticated clients");
    }
    if let Some(backlog) = config.endpoints.connection_backlog {
        debug!(backlog, "listen backlog is managed by rumqttd");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{
        EncryptedEndpointOptions, EndpointConfig, TcpEndpointOptions, TlsVersion,
    };
    use crate::engine::{TcpAdapter, WebSocketAdapter};
    use crate::settings::Settings;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    fn start_config(endpoints: EndpointConfig) -> BrokerStartConfig {
        BrokerStartConfig {
            endpoints,
            max_pending_messages_per_client: 250,
            communication_timeout: Duration::from_secs(15),
            handlers: Handlers::from_settings(&Settings::default()),
        }
    }

    fn plain(port: u16) -> EndpointConfig {
        EndpointConfig {
            tcp: Listener::Enabled(TcpEndpointOptions {
                bound_ipv4: Some(Ipv4Addr::LOCALHOST),
                bound_ipv6: None,
                port: Some(port),
            }),
            encrypted: Listener::Disabled,
            connection_backlog: Some(10),
        }
    }

    fn adapters(ws: WebSocketAdapter) -> Vec<TransportAdapter> {
        vec![
            TransportAdapter::Tcp(TcpAdapter),
            TransportAdapter::WebSocket(Arc::new(ws)),
        ]
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_config_plain_listener() {
        let config = start_config(plain(1884));
        let rumqttd = to_rumqttd_config(&adapters(WebSocketAdapter::detached()), &config).unwrap();

        let v4 = rumqttd.v4.as_ref().unwrap();
        assert_eq!(v4.len(), 1);
        let tcp = &v4["tcp"];
        assert_eq!(tcp.listen, "127.0.0.1:1884".parse().unwrap());
        assert!(tcp.tls.is_none());
        assert_eq!(tcp.connections.connection_timeout_ms, 15000);
        assert_eq!(tcp.connections.max_inflight_count, 250);
        assert!(tcp.connections.external_auth.is_none());
        assert!(rumqttd.ws.is_none());
    }

    #[test]
    fn test_config_ipv6_and_websocket() {
        let mut endpoints = plain(1884);
        endpoints.tcp = Listener::Enabled(TcpEndpointOptions {
            bound_ipv4: None,
            bound_ipv6: Some("::1".parse().unwrap()),
            port: None,
        });
        let config = start_config(endpoints);
        let ws = WebSocketAdapter::listening("127.0.0.1:9001".parse().unwrap());
        let rumqttd = to_rumqttd_config(&adapters(ws), &config).unwrap();

        let v4 = rumqttd.v4.as_ref().unwrap();
        assert_eq!(v4["tcp"].listen, "0.0.0.0:1883".parse().unwrap());
        assert_eq!(v4["tcp-v6"].listen, "[::1]:1883".parse().unwrap());
        let ws = rumqttd.ws.as_ref().unwrap();
        assert_eq!(ws["ws"].listen, "127.0.0.1:9001".parse().unwrap());
    }

    #[test]
    fn test_config_tls_listener() {
        let dir = tempfile::tempdir().unwrap();
        let certificate = crate::tests::test_certificate(&dir).read_certificate().unwrap();
        let mut endpoints = plain(1884);
        endpoints.tcp = Listener::Disabled;
        endpoints.encrypted = Listener::Enabled(EncryptedEndpointOptions {
            bound_ipv4: None,
            bound_ipv6: None,
            port: None,
            certificate,
            min_tls_version: TlsVersion::Tls12,
        });
        let config = start_config(endpoints);
        let rumqttd = to_rumqttd_config(&adapters(WebSocketAdapter::detached()), &config).unwrap();

        let v4 = rumqttd.v4.as_ref().unwrap();
        assert_eq!(v4.len(), 1);
        assert_eq!(v4["tls"].listen, "0.0.0.0:8883".parse().unwrap());
        assert!(v4["tls"].tls.is_some());
    }

    #[test]
    fn test_config_without_tcp_adapter_opens_no_tcp_listener() {
        let config = start_config(plain(1884));
        let rumqttd = to_rumqttd_config(&[], &config).unwrap();
        assert!(rumqttd.v4.as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_timeout_saturates() {
        let mut config = start_config(plain(1884));
        config.communication_timeout = Duration::from_secs(3600);
        let rumqttd = to_rumqttd_config(&adapters(WebSocketAdapter::detached()), &config).unwrap();
        assert_eq!(
            rumqttd.v4.as_ref().unwrap()["tcp"].connections.connection_timeout_ms,
            u16::MAX
        );
    }

    #[test]
    fn test_connection_timeout_ms() {
        assert_eq!(connection_timeout_ms(Duration::from_secs(15)), 15000);
        assert_eq!(connection_timeout_ms(Duration::from_millis(65535)), u16::MAX);
        assert_eq!(connection_timeout_ms(Duration::from_millis(65536)), u16::MAX);
        assert_eq!(connection_timeout_ms(Duration::from_secs(3600)), u16::MAX);
    }

    #[tokio::test]
    async fn test_external_auth_fires_connected() {
        let mut settings = Settings::default();
        settings
            .users
            .insert("admin".to_string(), "secret".to_string());
        let mut handlers = Handlers::from_settings(&settings);
        let connected = Arc::new(AtomicUsize::new(0));
        let c = connected.clone();
        handlers.client_connected = Arc::new(move |_id: &str| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let auth = external_auth(&handlers).unwrap();
        assert!(auth("c1".into(), "admin".into(), "secret".into()).await);
        assert!(!auth("c2".into(), "admin".into(), "wrong".into()).await);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_before_start() {
        let engine = RumqttdFactory.create_engine(adapters(WebSocketAdapter::detached()));
        assert!(!engine.is_running());
        let err = engine
            .publish(ApplicationMessage::new("a/b", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotRunning));
    }

    #[tokio::test]
    async fn test_start_fails_on_bound_port() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let engine = RumqttdEngine::new(adapters(WebSocketAdapter::detached()));
        let err = engine.start(start_config(plain(port))).await.unwrap_err();
        assert!(matches!(err, Error::EngineStart(_)));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_start_fails_on_colliding_listeners() {
        let port = free_port();
        let ws = WebSocketAdapter::listening(SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
        let engine = RumqttdEngine::new(adapters(ws));
        let err = engine.start(start_config(plain(port))).await.unwrap_err();
        assert!(matches!(err, Error::EngineStart(_)));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_retained_publish_reaches_late_subscriber() {
        let port = free_port();
        let engine = RumqttdEngine::new(adapters(WebSocketAdapter::detached()));
        engine.start(start_config(plain(port))).await.unwrap();
        engine
            .publish(ApplicationMessage::new("a/b", "x").with_retain(true))
            .await
            .unwrap();

        let options = rumqttc::MqttOptions::new("late-subscriber", "127.0.0.1", port);
        let (client, mut event_loop) = rumqttc::AsyncClient::new(options, 10);
        client
            .subscribe("a/b", rumqttc::QoS::AtMostOnce)
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) =
                    event_loop.poll().await.unwrap()
                {
                    return p;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received.topic, "a/b");
        assert_eq!(received.payload.as_ref(), b"x");
        assert!(received.retain);
    }

    #[tokio::test]
    async fn test_start_and_publish() {
        let engine = RumqttdEngine::new(adapters(WebSocketAdapter::detached()));
        engine.start(start_config(plain(free_port()))).await.unwrap();
        assert!(engine.is_running());

        engine
            .publish(ApplicationMessage::new("a/b", "hello").with_qos(QoS::ExactlyOnce))
            .await
            .unwrap();

        let err = engine
            .start(start_config(plain(free_port())))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));
    }
}
