//! Publish façade.
//!
//! The capability scripts see as `publish`. A script passes a table with
//! `topic`, optional `retain`, `qos` and `payload` fields; the façade turns
//! it into an [`ApplicationMessage`] and publishes it through the engine.
//! Failures are logged, never raised back into the script.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::payload::{PayloadInput, normalize};
use crate::script::{ScriptFunc, ScriptValue, script_func};
use crate::types::{ApplicationMessage, QoS};

/// A publish request as a script supplies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub retain: bool,
    pub qos: QoS,
    pub payload: PayloadInput,
}

impl PublishRequest {
    /// Create a QoS 0, non-retained request with no payload.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            retain: false,
            qos: QoS::AtMostOnce,
            payload: PayloadInput::Absent,
        }
    }

    pub fn with_payload(mut self, payload: PayloadInput) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Parse the argument of a script `publish` call.
    ///
    /// The argument must be a table. `topic` is a required non-empty
    /// string, `retain` a boolean (default false), `qos` an integer in
    /// `0..=2` (default 0). Unknown fields are ignored.
    pub fn from_script(value: ScriptValue) -> Result<Self> {
        let mut fields = match value {
            ScriptValue::Table(fields) => fields,
            other => {
                return Err(Error::InvalidPublishRequest(format!(
                    "expected a table, got {}",
                    other.type_name()
                )));
            }
        };

        let topic = match take(&mut fields, "topic") {
            ScriptValue::String(s) if !s.is_empty() => s,
            ScriptValue::String(_) => {
                return Err(Error::InvalidPublishRequest("topic is empty".to_string()));
            }
            ScriptValue::Nil => {
                return Err(Error::InvalidPublishRequest("topic is required".to_string()));
            }
            other => {
                return Err(Error::InvalidPublishRequest(format!(
                    "topic must be a string, got {}",
                    other.type_name()
                )));
            }
        };

        let retain = match take(&mut fields, "retain") {
            ScriptValue::Nil => false,
            ScriptValue::Boolean(b) => b,
            other => {
                return Err(Error::InvalidPublishRequest(format!(
                    "retain must be a boolean, got {}",
                    other.type_name()
                )));
            }
        };

        let qos = match take(&mut fields, "qos") {
            ScriptValue::Nil => QoS::AtMostOnce,
            other => match other.as_integer() {
                Some(level) => QoS::try_from(level)?,
                None => {
                    return Err(Error::InvalidPublishRequest(format!(
                        "qos must be an integer, got {}",
                        other.type_name()
                    )));
                }
            },
        };

        let payload = PayloadInput::try_from(take(&mut fields, "payload"))?;

        Ok(Self {
            topic,
            retain,
            qos,
            payload,
        })
    }

    /// Build the message the engine publishes.
    pub fn into_message(self) -> ApplicationMessage {
        ApplicationMessage::new(self.topic, normalize(&self.payload))
            .with_qos(self.qos)
            .with_retain(self.retain)
    }
}

fn take(fields: &mut BTreeMap<String, ScriptValue>, key: &str) -> ScriptValue {
    fields.remove(key).unwrap_or(ScriptValue::Nil)
}

/// Publishes messages through a running engine.
pub struct Publisher<E> {
    engine: Arc<E>,
}

impl<E> Clone for Publisher<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<E: Engine + 'static> Publisher<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    /// Publish and report the outcome.
    pub async fn try_publish(&self, request: PublishRequest) -> Result<()> {
        if request.topic.is_empty() {
            return Err(Error::InvalidPublishRequest("topic is empty".to_string()));
        }
        let message = request.into_message();
        debug!(
            topic = %message.topic,
            qos = %message.qos,
            retain = message.retain,
            len = message.payload.len(),
            "publishing"
        );
        self.engine.publish(message).await
    }

    /// Publish, logging any failure instead of returning it.
    pub async fn publish(&self, request: PublishRequest) {
        if let Err(e) = self.try_publish(request).await {
            log_failure(&e);
        }
    }

    /// Publish from a script argument, logging any failure.
    pub async fn publish_script(&self, value: ScriptValue) {
        match PublishRequest::from_script(value) {
            Ok(request) => self.publish(request).await,
            Err(e) => log_failure(&e),
        }
    }

    /// The `publish` function handed to the script host.
    pub fn into_script_func(self) -> ScriptFunc {
        script_func(move |arg| {
            let publisher = self.clone();
            async move { publisher.publish_script(arg).await }
        })
    }
}

fn log_failure(e: &Error) {
    match e {
        Error::InvalidPublishRequest(_) | Error::UnsupportedPayloadType(_) => {
            warn!("publish rejected: {}", e)
        }
        _ => error!("publish failed: {}", e),
    }
}
