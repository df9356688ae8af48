//! Broker lifecycle handlers and interceptors.
//!
//! The server always wires seven extension points into the engine before it
//! starts:
//!
//! - **Lifecycle handlers**: client connected, client disconnected, topic
//!   subscribed, topic unsubscribed.
//! - **Interceptors**: connection validator, subscription interceptor,
//!   application message interceptor.
//!
//! [`Handlers`] holds one object per slot; none of them is optional.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::settings::Settings;
use crate::types::ApplicationMessage;

/// Outcome of an interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interception<T> {
    /// Let the operation proceed with this (possibly modified) value.
    Accept(T),
    /// Refuse the operation.
    Reject,
}

impl<T> Interception<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Interception::Accept(_))
    }

    /// The accepted value, if any.
    pub fn accepted(self) -> Option<T> {
        match self {
            Interception::Accept(v) => Some(v),
            Interception::Reject => None,
        }
    }
}

/// Called after a client connected.
pub trait ClientConnectedHandler: Send + Sync {
    fn handle_client_connected(&self, client_id: &str);
}

/// Called after a client disconnected.
pub trait ClientDisconnectedHandler: Send + Sync {
    fn handle_client_disconnected(&self, client_id: &str);
}

/// Called after a client subscribed to a topic filter.
pub trait ClientSubscribedTopicHandler: Send + Sync {
    fn handle_client_subscribed_topic(&self, client_id: &str, topic_filter: &str);
}

/// Called after a client unsubscribed from a topic filter.
pub trait ClientUnsubscribedTopicHandler: Send + Sync {
    fn handle_client_unsubscribed_topic(&self, client_id: &str, topic_filter: &str);
}

/// Accepts or rejects a connecting client.
pub trait ConnectionValidator: Send + Sync {
    /// Returns true to allow the connection.
    fn validate_connection(&self, client_id: &str, username: &str, password: &[u8]) -> bool;

    /// Whether clients must present credentials at all. Engines may skip
    /// validation entirely for validators that return false.
    fn requires_credentials(&self) -> bool {
        true
    }
}

/// Accepts, rejects or rewrites a subscribe request.
pub trait SubscriptionInterceptor: Send + Sync {
    fn intercept_subscription(&self, client_id: &str, topic_filter: String)
        -> Interception<String>;
}

/// Accepts, rejects or rewrites a published message.
pub trait ApplicationMessageInterceptor: Send + Sync {
    /// `client_id` is `None` for messages the server publishes itself.
    fn intercept_application_message(
        &self,
        client_id: Option<&str>,
        message: ApplicationMessage,
    ) -> Interception<ApplicationMessage>;
}

impl<F> ClientConnectedHandler for F
where
    F: Fn(&str) + Send + Sync,
{
    fn handle_client_connected(&self, client_id: &str) {
        self(client_id)
    }
}

impl<F> ClientDisconnectedHandler for F
where
    F: Fn(&str) + Send + Sync,
{
    fn handle_client_disconnected(&self, client_id: &str) {
        self(client_id)
    }
}

impl<F> ClientSubscribedTopicHandler for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn handle_client_subscribed_topic(&self, client_id: &str, topic_filter: &str) {
        self(client_id, topic_filter)
    }
}

impl<F> ClientUnsubscribedTopicHandler for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn handle_client_unsubscribed_topic(&self, client_id: &str, topic_filter: &str) {
        self(client_id, topic_filter)
    }
}

/// The seven extension points wired into the engine.
#[derive(Clone)]
pub struct Handlers {
    pub client_connected: Arc<dyn ClientConnectedHandler>,
    pub client_disconnected: Arc<dyn ClientDisconnectedHandler>,
    pub client_subscribed_topic: Arc<dyn ClientSubscribedTopicHandler>,
    pub client_unsubscribed_topic: Arc<dyn ClientUnsubscribedTopicHandler>,
    pub connection_validator: Arc<dyn ConnectionValidator>,
    pub subscription_interceptor: Arc<dyn SubscriptionInterceptor>,
    pub application_message_interceptor: Arc<dyn ApplicationMessageInterceptor>,
}

impl Handlers {
    /// Stock handlers: audit logging for lifecycle events, credentials from
    /// the settings `users` map, and pass-through interceptors.
    pub fn from_settings(settings: &Settings) -> Self {
        let audit = Arc::new(AuditLog);
        Self {
            client_connected: audit.clone(),
            client_disconnected: audit.clone(),
            client_subscribed_topic: audit.clone(),
            client_unsubscribed_topic: audit,
            connection_validator: Arc::new(StaticCredentials::new(settings.users.clone())),
            subscription_interceptor: Arc::new(AllowAll),
            application_message_interceptor: Arc::new(AllowAll),
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers").finish_non_exhaustive()
    }
}

/// Accepts every connection, subscription and message unchanged.
#[derive(Debug, Default, Clone)]
pub struct AllowAll;

impl ConnectionValidator for AllowAll {
    fn validate_connection(&self, _client_id: &str, _username: &str, _password: &[u8]) -> bool {
        true
    }

    fn requires_credentials(&self) -> bool {
        false
    }
}

impl SubscriptionInterceptor for AllowAll {
    fn intercept_subscription(
        &self,
        _client_id: &str,
        topic_filter: String,
    ) -> Interception<String> {
        Interception::Accept(topic_filter)
    }
}

impl ApplicationMessageInterceptor for AllowAll {
    fn intercept_application_message(
        &self,
        _client_id: Option<&str>,
        message: ApplicationMessage,
    ) -> Interception<ApplicationMessage> {
        Interception::Accept(message)
    }
}

/// Username/password validator. With no users configured every client is
/// accepted.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    users: BTreeMap<String, String>,
}

impl StaticCredentials {
    pub fn new(users: BTreeMap<String, String>) -> Self {
        Self { users }
    }
}

impl ConnectionValidator for StaticCredentials {
    fn validate_connection(&self, client_id: &str, username: &str, password: &[u8]) -> bool {
        if self.users.is_empty() {
            return true;
        }
        let ok = self
            .users
            .get(username)
            .is_some_and(|expected| expected.as_bytes() == password);
        if !ok {
            info!(client_id, username, "connection rejected: bad credentials");
        }
        ok
    }

    fn requires_credentials(&self) -> bool {
        !self.users.is_empty()
    }
}

/// Logs every lifecycle event.
#[derive(Debug, Default, Clone)]
pub struct AuditLog;

impl ClientConnectedHandler for AuditLog {
    fn handle_client_connected(&self, client_id: &str) {
        info!(client_id, "client connected");
    }
}

impl ClientDisconnectedHandler for AuditLog {
    fn handle_client_disconnected(&self, client_id: &str) {
        info!(client_id, "client disconnected");
    }
}

impl ClientSubscribedTopicHandler for AuditLog {
    fn handle_client_subscribed_topic(&self, client_id: &str, topic_filter: &str) {
        info!(client_id, topic_filter, "client subscribed");
    }
}

impl ClientUnsubscribedTopicHandler for AuditLog {
    fn handle_client_unsubscribed_topic(&self, client_id: &str, topic_filter: &str) {
        info!(client_id, topic_filter, "client unsubscribed");
    }
}
