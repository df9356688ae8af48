//! Error types for the MQTT server.

use thiserror::Error;

/// Error type for MQTT server operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Endpoint settings cannot produce a usable listener.
    ///
    /// Fatal at startup, e.g. an encrypted endpoint without a certificate.
    #[error("mqttsrv: invalid endpoint configuration: {0}")]
    InvalidEndpointConfiguration(String),

    /// Settings file could not be parsed.
    #[error("mqttsrv: invalid settings: {0}")]
    InvalidSettings(String),

    /// The broker engine failed to start.
    #[error("mqttsrv: engine start failure: {0}")]
    EngineStart(String),

    /// The broker engine was asked to start twice.
    #[error("mqttsrv: engine already started")]
    AlreadyStarted,

    /// The broker engine is not running.
    #[error("mqttsrv: engine not running")]
    NotRunning,

    /// A script supplied a payload of a type that cannot become bytes.
    #[error("mqttsrv: unsupported payload type: {0}")]
    UnsupportedPayloadType(String),

    /// A script supplied a malformed publish request.
    #[error("mqttsrv: invalid publish request: {0}")]
    InvalidPublishRequest(String),

    /// The broker engine rejected or lost a published message.
    #[error("mqttsrv: engine publish failure: {0}")]
    EnginePublish(String),

    /// Script host registration or dispatch error.
    #[error("mqttsrv: script error: {0}")]
    Script(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::InvalidSettings(e.to_string())
    }
}

/// Result type for MQTT server operations.
pub type Result<T> = std::result::Result<T, Error>;
