//! Server settings.
//!
//! Settings are read once at startup from a YAML file, by default
//! `~/.giztoy/mqttsrv/config.yaml`. Every field is optional in the file;
//! missing fields take the defaults below.
//!
//! ```yaml
//! tcp_endpoint:
//!   enabled: true
//!   ipv4: 0.0.0.0
//!   port: 1883
//! encrypted_tcp_endpoint:
//!   enabled: true
//!   port: 8883
//!   certificate:
//!     path: /etc/mqttsrv/server.crt
//!     key_path: /etc/mqttsrv/server.key
//! communication_timeout: 15
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default base configuration directory name.
pub const DEFAULT_BASE_DIR: &str = ".giztoy";
/// Default application directory name.
pub const DEFAULT_APP_NAME: &str = "mqttsrv";
/// Default configuration filename.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Top-level server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Unencrypted TCP listener.
    pub tcp_endpoint: TcpEndpointSettings,
    /// TLS listener.
    pub encrypted_tcp_endpoint: EncryptedTcpEndpointSettings,
    /// WebSocket listener.
    pub web_socket_endpoint: WebSocketEndpointSettings,
    /// Username to password map. Empty accepts every client.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<String, String>,
    /// Maximum queued outgoing messages per client.
    pub max_pending_messages_per_client: usize,
    /// Idle client timeout, in seconds.
    pub communication_timeout: u64,
    /// Listen backlog. Zero or negative keeps the engine default.
    pub connection_backlog: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tcp_endpoint: TcpEndpointSettings::default(),
            encrypted_tcp_endpoint: EncryptedTcpEndpointSettings::default(),
            web_socket_endpoint: WebSocketEndpointSettings::default(),
            users: BTreeMap::new(),
            max_pending_messages_per_client: 250,
            communication_timeout: 15,
            connection_backlog: 10,
        }
    }
}

/// Unencrypted TCP endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpEndpointSettings {
    pub enabled: bool,
    /// IPv4 bind address literal.
    pub ipv4: Option<String>,
    /// IPv6 bind address literal.
    pub ipv6: Option<String>,
    /// Listening port; absent, zero or negative uses the engine default.
    pub port: Option<i64>,
}

impl Default for TcpEndpointSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ipv4: None,
            ipv6: None,
            port: None,
        }
    }
}

impl TcpEndpointSettings {
    /// Parsed IPv4 bind address, if one is configured and valid.
    pub fn try_read_ipv4(&self) -> Option<Ipv4Addr> {
        parse_ipv4(self.ipv4.as_deref())
    }

    /// Parsed IPv6 bind address, if one is configured and valid.
    pub fn try_read_ipv6(&self) -> Option<Ipv6Addr> {
        parse_ipv6(self.ipv6.as_deref())
    }
}

/// TLS endpoint settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptedTcpEndpointSettings {
    pub enabled: bool,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub port: Option<i64>,
    /// Server certificate. Required when `enabled` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateSettings>,
}

impl EncryptedTcpEndpointSettings {
    /// Parsed IPv4 bind address, if one is configured and valid.
    pub fn try_read_ipv4(&self) -> Option<Ipv4Addr> {
        parse_ipv4(self.ipv4.as_deref())
    }

    /// Parsed IPv6 bind address, if one is configured and valid.
    pub fn try_read_ipv6(&self) -> Option<Ipv6Addr> {
        parse_ipv6(self.ipv6.as_deref())
    }

    /// Load the configured certificate.
    ///
    /// Fails with [`Error::InvalidEndpointConfiguration`] when no certificate
    /// is configured or the files do not hold a usable chain and key.
    pub fn read_certificate(&self) -> Result<Certificate> {
        match &self.certificate {
            Some(cert) => cert.read_certificate(),
            None => Err(Error::InvalidEndpointConfiguration(
                "encrypted endpoint is enabled but no certificate is configured".to_string(),
            )),
        }
    }
}

/// WebSocket endpoint settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketEndpointSettings {
    pub enabled: bool,
    pub ipv4: Option<String>,
    pub port: Option<i64>,
}

impl WebSocketEndpointSettings {
    /// Parsed IPv4 bind address, if one is configured and valid.
    pub fn try_read_ipv4(&self) -> Option<Ipv4Addr> {
        parse_ipv4(self.ipv4.as_deref())
    }
}

/// PEM certificate chain and private key locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateSettings {
    /// PEM file holding the certificate chain, leaf first.
    pub path: PathBuf,
    /// PEM file holding the private key.
    pub key_path: PathBuf,
}

impl CertificateSettings {
    /// Read both PEM files and check that rustls accepts them as a server
    /// identity.
    pub fn read_certificate(&self) -> Result<Certificate> {
        let mut reader = BufReader::new(open_pem(&self.path)?);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| pem_error(&self.path, e))?;
        let chain_len = certs.len();
        if chain_len == 0 {
            return Err(Error::InvalidEndpointConfiguration(format!(
                "{}: no certificate found",
                self.path.display()
            )));
        }

        let mut reader = BufReader::new(open_pem(&self.key_path)?);
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| pem_error(&self.key_path, e))?
            .ok_or_else(|| {
                Error::InvalidEndpointConfiguration(format!(
                    "{}: no private key found",
                    self.key_path.display()
                ))
            })?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .and_then(|builder| builder.with_no_client_auth().with_single_cert(certs, key))
            .map_err(|e| {
                Error::InvalidEndpointConfiguration(format!(
                    "{} / {}: {}",
                    self.path.display(),
                    self.key_path.display(),
                    e
                ))
            })?;

        Ok(Certificate {
            cert_path: self.path.clone(),
            key_path: self.key_path.clone(),
            chain_len,
        })
    }
}

/// A certificate whose files were read and checked.
///
/// The engine receives file locations rather than parsed keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    cert_path: PathBuf,
    key_path: PathBuf,
    chain_len: usize,
}

impl Certificate {
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Number of certificates in the chain.
    pub fn chain_len(&self) -> usize {
        self.chain_len
    }
}

fn open_pem(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| pem_error(path, e))
}

fn pem_error(path: &Path, e: std::io::Error) -> Error {
    Error::InvalidEndpointConfiguration(format!("{}: {}", path.display(), e))
}

fn parse_ipv4(s: Option<&str>) -> Option<Ipv4Addr> {
    s.and_then(|s| s.trim().parse().ok())
}

fn parse_ipv6(s: Option<&str>) -> Option<Ipv6Addr> {
    s.and_then(|s| s.trim().parse().ok())
}

impl Settings {
    /// Gets the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| {
            home.join(DEFAULT_BASE_DIR)
                .join(DEFAULT_APP_NAME)
                .join(DEFAULT_CONFIG_FILE)
        })
    }

    /// Parse settings from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load settings.
    ///
    /// An explicit path must exist. Without one, the default path is used
    /// if present and built-in defaults otherwise.
    pub fn load(custom_path: Option<&Path>) -> Result<Self> {
        let path = match custom_path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_config_path() {
                Some(p) if p.exists() => p,
                _ => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&path)?;
        Self::from_yaml(&content)
    }
}
